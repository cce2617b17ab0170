//! Generación de código.
//!
//! Recorre declaraciones y expresiones ya analizadas y las reduce a IR
//! de LLVM dentro de un módulo en memoria, a través de `inkwell`. Todo
//! valor del lenguaje es un `double` de 64 bits; las funciones tienen
//! firma `double(double, ...)`.
//!
//! # Variables mutables
//! Los parámetros y la variable de inducción de un `for` se alojan en
//! celdas de pila (`alloca`) en el bloque de entrada de la función, en
//! vez de usarse como valores SSA directos. La pasada `mem2reg` del
//! pipeline de optimización los promueve después a registros,
//! insertando los nodos phi necesarios. Esto evita colocar phis a mano
//! para toda variable asignable.
//!
//! # Emisión
//! El módulo puede emitirse como listado textual de IR o como archivo
//! objeto relocalizable para la máquina objetivo configurada. En ambos
//! casos el pipeline de optimización se ejecuta primero.

use std::collections::HashMap;
use std::io::Write;

use inkwell::{
    basic_block::BasicBlock,
    builder::{Builder, BuilderError},
    context::Context,
    module::Module,
    passes::PassBuilderOptions,
    targets::{
        CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
    },
    types::BasicMetadataTypeEnum,
    values::{BasicMetadataValueEnum, FloatValue, FunctionValue, PointerValue},
    FloatPredicate, OptimizationLevel,
};
use thiserror::Error;

use crate::{
    parse::{Declaration, Expr, Prototype},
    source::{Located, Location},
};

/// Pasadas que se ejecutan, en orden, antes de cada emisión.
const PASS_PIPELINE: &str = "mem2reg,instcombine,reassociate,gvn,simplifycfg";

/// Error de generación de código, asociado al constructo que lo causó.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("function `{0}` takes {1} arguments, {2} were supplied")]
    BadArity(String, u32, usize),

    #[error("invalid binary operator `{0}`")]
    InvalidOperator(char),

    #[error("destination of '=' must be a variable")]
    BadAssignment,

    #[error("function `{0}` cannot be redefined")]
    Redefinition(String),

    #[error("conflicting declarations of `{0}`")]
    SignatureConflict(String),

    #[error("function `{0}` failed IR verification")]
    BadFunction(String),

    #[error("malformed IR: {0}")]
    Builder(#[from] BuilderError),
}

/// Error fatal de configuración de la máquina objetivo o de emisión.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("unknown target triple `{0}`: {1}")]
    UnknownTriple(String, String),

    #[error("cannot create a target machine for `{0}`")]
    BadMachine(String),

    #[error("optimization pipeline failed: {0}")]
    BadPasses(String),

    #[error("object emission failed: {0}")]
    BadObject(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Gen<T> = Result<T, Located<CodegenError>>;

/// Asocia una ubicación a errores provenientes del builder.
fn at<E>(location: &Location) -> impl FnOnce(E) -> Located<CodegenError> + '_
where
    E: Into<CodegenError>,
{
    move |error| Located {
        value: error.into(),
        location: location.clone(),
    }
}

/// Tabla de símbolos de la función en curso.
///
/// Pila de alcances: se abre uno por cuerpo de función y uno por cada
/// `for`, y la resolución camina hacia afuera. Cada nombre queda ligado
/// a la celda de pila que lo respalda.
struct SymbolTable<'ctx> {
    scopes: Vec<HashMap<String, PointerValue<'ctx>>>,
}

impl<'ctx> SymbolTable<'ctx> {
    fn new() -> Self {
        SymbolTable {
            scopes: vec![HashMap::new()],
        }
    }

    /// Descarta todo y deja un único alcance vacío.
    fn reset(&mut self) {
        self.scopes.clear();
        self.scopes.push(HashMap::new());
    }

    fn enter(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn exit(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: String, slot: PointerValue<'ctx>) {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.insert(name, slot);
            }
            None => unreachable!(),
        }
    }

    fn resolve(&self, name: &str) -> Option<PointerValue<'ctx>> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }
}

/// Generador de código sobre un módulo en memoria.
///
/// El generador posee el módulo, el builder de instrucciones, la
/// máquina objetivo y la tabla de símbolos. El módulo se libera antes
/// que la máquina al destruir el generador.
pub struct Generator<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    machine: TargetMachine,
    names: SymbolTable<'ctx>,
}

impl<'ctx> Generator<'ctx> {
    /// Configura la máquina objetivo y crea un módulo vacío.
    ///
    /// Sin un triple explícito se usa el de la máquina anfitriona. El
    /// layout de datos y el triple del módulo quedan fijados por la
    /// máquina objetivo resultante.
    pub fn new(context: &'ctx Context, name: &str, triple: Option<&str>) -> Result<Self, TargetError> {
        Target::initialize_all(&InitializationConfig::default());

        let triple = match triple {
            Some(requested) => TargetTriple::create(requested),
            None => TargetMachine::get_default_triple(),
        };

        let spelled = triple.as_str().to_string_lossy().into_owned();
        let target = Target::from_triple(&triple)
            .map_err(|error| TargetError::UnknownTriple(spelled.clone(), error.to_string()))?;

        let machine = target
            .create_target_machine(
                &triple,
                "generic",
                "",
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::Default,
            )
            .ok_or(TargetError::BadMachine(spelled))?;

        let module = context.create_module(name);
        module.set_triple(&triple);
        module.set_data_layout(&machine.get_target_data().get_data_layout());

        Ok(Generator {
            context,
            module,
            builder: context.create_builder(),
            machine,
            names: SymbolTable::new(),
        })
    }

    /// Obtiene el módulo construido hasta el momento.
    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    /// Agrega una declaración al módulo.
    pub fn declaration(&mut self, declaration: &Declaration) -> Gen<()> {
        match declaration {
            Declaration::Prototype(prototype) => self.prototype(prototype).map(|_| ()),
            Declaration::Function { prototype, body } => {
                self.function(prototype, body).map(|_| ())
            }

            // Ya diagnosticado por el parser
            Declaration::Error(_) => Ok(()),
        }
    }

    /// Declara una función por firma, o reutiliza la existente.
    ///
    /// Declarar la misma función varias veces es válido mientras la
    /// aridad coincida.
    fn prototype(&mut self, prototype: &Prototype) -> Gen<FunctionValue<'ctx>> {
        let name = &prototype.name.value;
        if let Some(existing) = self.module.get_function(name) {
            if existing.count_params() as usize != prototype.params.len() {
                return Err(Located {
                    value: CodegenError::SignatureConflict(name.clone()),
                    location: prototype.name.location.clone(),
                });
            }

            return Ok(existing);
        }

        let double = self.context.f64_type();
        let params = vec![BasicMetadataTypeEnum::from(double); prototype.params.len()];
        let signature = double.fn_type(&params, false);

        let function = self.module.add_function(name, signature, None);
        for (param, name) in function.get_param_iter().zip(&prototype.params) {
            param.into_float_value().set_name(name);
        }

        Ok(function)
    }

    /// Define una función con cuerpo.
    ///
    /// Cada parámetro se copia a una celda de pila en el bloque de
    /// entrada y se liga en la tabla de símbolos; `mem2reg` deshace las
    /// celdas más adelante. Si el cuerpo falla o el verificador
    /// rechaza el resultado, la función se borra del módulo.
    fn function(&mut self, prototype: &Prototype, body: &Located<Expr>) -> Gen<FunctionValue<'ctx>> {
        let function = self.prototype(prototype)?;
        if function.count_basic_blocks() > 0 {
            return Err(Located {
                value: CodegenError::Redefinition(prototype.name.value.clone()),
                location: prototype.name.location.clone(),
            });
        }

        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);

        self.names.reset();
        let double = self.context.f64_type();
        for (param, name) in function.get_param_iter().zip(&prototype.params) {
            let slot = self
                .builder
                .build_alloca(double, name)
                .map_err(at(&body.location))?;
            self.builder
                .build_store(slot, param)
                .map_err(at(&body.location))?;
            self.names.bind(name.clone(), slot);
        }

        let result = self.expression(body).and_then(|value| {
            self.builder
                .build_return(Some(&value))
                .map_err(at(&body.location))
        });

        match result {
            Ok(_) if function.verify(true) => Ok(function),
            Ok(_) => {
                unsafe { function.delete() };
                Err(Located {
                    value: CodegenError::BadFunction(prototype.name.value.clone()),
                    location: prototype.name.location.clone(),
                })
            }
            Err(error) => {
                unsafe { function.delete() };
                Err(error)
            }
        }
    }

    /// Reduce una expresión al valor `double` que produce.
    fn expression(&mut self, expression: &Located<Expr>) -> Gen<FloatValue<'ctx>> {
        let location = &expression.location;
        match &expression.value {
            Expr::Number { value } => Ok(self.context.f64_type().const_float(*value)),

            Expr::Variable { name } => {
                let slot = self.names.resolve(name).ok_or_else(|| Located {
                    value: CodegenError::UnknownVariable(name.clone()),
                    location: location.clone(),
                })?;

                let value = self
                    .builder
                    .build_load(slot, name)
                    .map_err(at(location))?;
                Ok(value.into_float_value())
            }

            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, location),
            Expr::Call { callee, args } => self.call(callee, args, location),

            Expr::If {
                condition,
                then,
                otherwise,
            } => self.conditional(condition, then, otherwise, location),

            Expr::For {
                index,
                start,
                end,
                step,
                body,
            } => self.repeat(index, start, end, step, body, location),
        }
    }

    fn binary(
        &mut self,
        op: char,
        lhs: &Located<Expr>,
        rhs: &Located<Expr>,
        location: &Location,
    ) -> Gen<FloatValue<'ctx>> {
        if op == '=' {
            return self.assign(lhs, rhs, location);
        }

        let l = self.expression(lhs)?;
        let r = self.expression(rhs)?;

        match op {
            '+' => self
                .builder
                .build_float_add(l, r, "addtmp")
                .map_err(at(location)),
            '-' => self
                .builder
                .build_float_sub(l, r, "subtmp")
                .map_err(at(location)),
            '*' => self
                .builder
                .build_float_mul(l, r, "multmp")
                .map_err(at(location)),
            '/' => self
                .builder
                .build_float_div(l, r, "divtmp")
                .map_err(at(location)),

            '<' => {
                let ordered = self
                    .builder
                    .build_float_compare(FloatPredicate::OLT, l, r, "cmptmp")
                    .map_err(at(location))?;

                // bool 0/1 a double 0.0 o 1.0
                self.builder
                    .build_unsigned_int_to_float(ordered, self.context.f64_type(), "booltmp")
                    .map_err(at(location))
            }

            op => Err(Located {
                value: CodegenError::InvalidOperator(op),
                location: location.clone(),
            }),
        }
    }

    /// Asignación: el operando izquierdo debe ser una variable ligada.
    /// El valor producido es el valor almacenado.
    fn assign(
        &mut self,
        target: &Located<Expr>,
        value: &Located<Expr>,
        location: &Location,
    ) -> Gen<FloatValue<'ctx>> {
        let name = match &target.value {
            Expr::Variable { name } => name,
            _ => {
                return Err(Located {
                    value: CodegenError::BadAssignment,
                    location: target.location.clone(),
                })
            }
        };

        let value = self.expression(value)?;
        let slot = self.names.resolve(name).ok_or_else(|| Located {
            value: CodegenError::UnknownVariable(name.clone()),
            location: target.location.clone(),
        })?;

        self.builder.build_store(slot, value).map_err(at(location))?;
        Ok(value)
    }

    fn call(
        &mut self,
        callee: &str,
        args: &[Located<Expr>],
        location: &Location,
    ) -> Gen<FloatValue<'ctx>> {
        let function = self.module.get_function(callee).ok_or_else(|| Located {
            value: CodegenError::UnknownFunction(callee.to_owned()),
            location: location.clone(),
        })?;

        if function.count_params() as usize != args.len() {
            return Err(Located {
                value: CodegenError::BadArity(callee.to_owned(), function.count_params(), args.len()),
                location: location.clone(),
            });
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(BasicMetadataValueEnum::from(self.expression(arg)?));
        }

        let call = self
            .builder
            .build_call(function, &values, "calltmp")
            .map_err(at(location))?;

        match call.try_as_basic_value().left() {
            Some(value) => Ok(value.into_float_value()),
            None => unreachable!(),
        }
    }

    /// Condicional con mezcla por phi.
    ///
    /// La condición se compara con 0.0 (ordenada, distinto-de). Cada
    /// rama se reduce en su propio bloque y salta a `merge`, donde un
    /// phi de dos entradas selecciona el valor. Los bloques de origen
    /// del phi son los que realmente terminan cada rama: el builder
    /// pudo haberse movido por control de flujo anidado.
    fn conditional(
        &mut self,
        condition: &Located<Expr>,
        then: &Located<Expr>,
        otherwise: &Located<Expr>,
        location: &Location,
    ) -> Gen<FloatValue<'ctx>> {
        let double = self.context.f64_type();

        let tested = self.expression(condition)?;
        let flag = self
            .builder
            .build_float_compare(
                FloatPredicate::ONE,
                tested,
                double.const_float(0.0),
                "ifcond",
            )
            .map_err(at(&condition.location))?;

        let function = self.current_function();
        let then_block = self.context.append_basic_block(function, "then");
        let else_block = self.context.append_basic_block(function, "else");
        let merge_block = self.context.append_basic_block(function, "merge");

        self.builder
            .build_conditional_branch(flag, then_block, else_block)
            .map_err(at(location))?;

        self.builder.position_at_end(then_block);
        let then_value = self.expression(then)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(at(location))?;
        let then_end = self.insert_block();

        self.builder.position_at_end(else_block);
        let else_value = self.expression(otherwise)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(at(location))?;
        let else_end = self.insert_block();

        self.builder.position_at_end(merge_block);
        let phi = self
            .builder
            .build_phi(double, "iftmp")
            .map_err(at(location))?;
        phi.add_incoming(&[(&then_value, then_end), (&else_value, else_end)]);

        Ok(phi.as_basic_value().into_float_value())
    }

    /// Ciclo `for`.
    ///
    /// La variable de inducción vive en una celda del bloque de
    /// entrada. En cada vuelta se reduce el cuerpo (su valor se
    /// descarta), se suma el paso y se reevalúa la condición de fin
    /// contra 0.0. El valor del ciclo completo es 0.0.
    fn repeat(
        &mut self,
        index: &str,
        start: &Located<Expr>,
        end: &Located<Expr>,
        step: &Located<Expr>,
        body: &Located<Expr>,
        location: &Location,
    ) -> Gen<FloatValue<'ctx>> {
        let double = self.context.f64_type();
        let function = self.current_function();

        let slot = self.entry_slot(function, index, location)?;
        let start_value = self.expression(start)?;
        self.builder
            .build_store(slot, start_value)
            .map_err(at(location))?;

        let loop_block = self.context.append_basic_block(function, "loop");
        let exit_block = self.context.append_basic_block(function, "afterloop");
        self.builder
            .build_unconditional_branch(loop_block)
            .map_err(at(location))?;

        self.builder.position_at_end(loop_block);
        self.names.enter();
        self.names.bind(index.to_owned(), slot);

        self.expression(body)?;

        let step_value = self.expression(step)?;
        let current = self
            .builder
            .build_load(slot, index)
            .map_err(at(location))?;
        let next = self
            .builder
            .build_float_add(current.into_float_value(), step_value, "nextvar")
            .map_err(at(location))?;
        self.builder.build_store(slot, next).map_err(at(location))?;

        let end_value = self.expression(end)?;
        let keep_going = self
            .builder
            .build_float_compare(
                FloatPredicate::ONE,
                end_value,
                double.const_float(0.0),
                "loopcond",
            )
            .map_err(at(&end.location))?;

        self.builder
            .build_conditional_branch(keep_going, loop_block, exit_block)
            .map_err(at(location))?;

        self.names.exit();
        self.builder.position_at_end(exit_block);

        Ok(double.const_float(0.0))
    }

    /// Reserva una celda `double` en el bloque de entrada de la
    /// función, con un builder dedicado para no mover el principal.
    fn entry_slot(
        &self,
        function: FunctionValue<'ctx>,
        name: &str,
        location: &Location,
    ) -> Gen<PointerValue<'ctx>> {
        let entry = match function.get_first_basic_block() {
            Some(block) => block,
            None => unreachable!(),
        };

        let builder = self.context.create_builder();
        match entry.get_first_instruction() {
            Some(first) => builder.position_before(&first),
            None => builder.position_at_end(entry),
        }

        builder
            .build_alloca(self.context.f64_type(), name)
            .map_err(at(location))
    }

    fn insert_block(&self) -> BasicBlock<'ctx> {
        match self.builder.get_insert_block() {
            Some(block) => block,
            None => unreachable!(),
        }
    }

    fn current_function(&self) -> FunctionValue<'ctx> {
        match self.insert_block().get_parent() {
            Some(function) => function,
            None => unreachable!(),
        }
    }

    /// Ejecuta el pipeline de optimización sobre el módulo completo.
    fn optimize(&self) -> Result<(), TargetError> {
        self.module
            .run_passes(PASS_PIPELINE, &self.machine, PassBuilderOptions::create())
            .map_err(|error| TargetError::BadPasses(error.to_string()))
    }

    /// Optimiza y escribe el listado textual de IR. El destino no se
    /// cierra.
    pub fn emit_ir<W: Write>(&self, output: &mut W) -> Result<(), TargetError> {
        self.optimize()?;
        output.write_all(self.module.print_to_string().to_bytes())?;

        Ok(())
    }

    /// Optimiza y escribe un archivo objeto relocalizable. El destino
    /// no se cierra.
    pub fn emit_obj<W: Write>(&self, output: &mut W) -> Result<(), TargetError> {
        self.optimize()?;
        let buffer = self
            .machine
            .write_to_memory_buffer(&self.module, FileType::Object)
            .map_err(|error| TargetError::BadObject(error.to_string()))?;
        output.write_all(buffer.as_slice())?;

        Ok(())
    }
}
