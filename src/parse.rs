//! Análisis sintáctico.
//!
//! Descenso recursivo con un token de lookahead. Los operadores
//! infijos se resuelven con el clásico ascenso por precedencias: al
//! encontrar un operador de mayor precedencia que el actual se
//! desciende con `actual + 1`, de lo contrario se pliega hacia la
//! izquierda. Cada nodo producido lleva la ubicación unificada de su
//! primer y último token.

use std::fmt::{self, Display};

use crate::{
    lex::{Lexer, Token},
    source::Located,
};
use thiserror::Error;

/// Un nodo de expresión.
///
/// Los hijos se poseen de manera exclusiva; el árbol es acíclico.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Constante numérica.
    Number { value: f64 },

    /// Lectura de una variable.
    Variable { name: String },

    /// Operación binaria infija.
    Binary {
        op: char,
        lhs: Box<Located<Expr>>,
        rhs: Box<Located<Expr>>,
    },

    /// Llamada a función.
    Call {
        callee: String,
        args: Vec<Located<Expr>>,
    },

    /// Condicional `if`/`then`/`else`.
    If {
        condition: Box<Located<Expr>>,
        then: Box<Located<Expr>>,
        otherwise: Box<Located<Expr>>,
    },

    /// Ciclo `for`/`in`. El paso siempre está presente: si el programa
    /// lo omite, el parser materializa la constante `1.0`.
    For {
        index: String,
        start: Box<Located<Expr>>,
        end: Box<Located<Expr>>,
        step: Box<Located<Expr>>,
        body: Box<Located<Expr>>,
    },
}

/// Firma de una función: nombre y parámetros, sin cuerpo.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub name: Located<String>,
    pub params: Vec<String>,
}

/// Un ítem de nivel superior.
#[derive(Debug, Clone)]
pub enum Declaration {
    /// Declaración `extern`.
    Prototype(Prototype),

    /// Definición con cuerpo. Una expresión suelta de nivel superior
    /// se envuelve aquí con un prototipo anónimo sin parámetros.
    Function {
        prototype: Prototype,
        body: Located<Expr>,
    },

    /// Marcador de error sintáctico, con su diagnóstico.
    Error(Located<ParserError>),
}

/// Error de análisis sintáctico.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParserError {
    #[error("expected an expression, found {0}")]
    ExpectedExpression(Token),

    #[error("expected ')'")]
    UnclosedParen,

    #[error("expected ')' or ',' in argument list")]
    BadArgumentList,

    #[error("expected function name in prototype")]
    ExpectedFunctionName,

    #[error("expected '(' in prototype")]
    ExpectedParameterList,

    #[error("expected ')' to close parameter list")]
    UnclosedParameterList,

    #[error("expected 'then' after condition")]
    ExpectedThen,

    #[error("expected 'else' after then-branch")]
    ExpectedElse,

    #[error("expected loop variable after 'for'")]
    ExpectedLoopVariable,

    #[error("expected '=' after loop variable")]
    ExpectedLoopStart,

    #[error("expected ',' after loop start value")]
    ExpectedLoopEnd,

    #[error("expected 'in' before loop body")]
    ExpectedIn,
}

pub type Parsed<T> = Result<T, Located<ParserError>>;

/// Precedencia de un operador infijo; `-1` si el carácter no lo es.
fn binary_precedence(op: char) -> i32 {
    match op {
        '=' => 2,
        '<' => 10,
        '+' | '-' => 20,
        '*' | '/' => 40,
        _ => -1,
    }
}

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Located<Token>,
}

impl<'src> Parser<'src> {
    pub fn new(mut lexer: Lexer<'src>) -> Self {
        let current = lexer.next_token();
        Parser { lexer, current }
    }

    /// Determina si la entrada está agotada.
    pub fn reached_end(&self) -> bool {
        matches!(self.current.value, Token::Eof)
    }

    /// Extrae el siguiente ítem de nivel superior.
    ///
    /// Los `;` sueltos se descartan. Ante un error sintáctico se
    /// consume el token ofensor para garantizar progreso y se entrega
    /// [`Declaration::Error`]; la siguiente llamada continúa a partir
    /// de ahí. Retorna `None` una vez agotada la entrada.
    pub fn parse(&mut self) -> Option<Declaration> {
        while matches!(self.current.value, Token::Char(';')) {
            self.shift();
        }

        let result = match self.current.value {
            Token::Eof => return None,
            Token::Def => self.definition(),
            Token::Extern => self.extern_declaration(),
            _ => self.top_level(),
        };

        Some(match result {
            Ok(declaration) => declaration,
            Err(error) => {
                self.shift();
                Declaration::Error(error)
            }
        })
    }

    /// `def` prototype expression
    fn definition(&mut self) -> Parsed<Declaration> {
        self.shift();
        let prototype = self.prototype()?;
        let body = self.expression()?;

        Ok(Declaration::Function { prototype, body })
    }

    /// `extern` prototype
    fn extern_declaration(&mut self) -> Parsed<Declaration> {
        self.shift();
        self.prototype().map(Declaration::Prototype)
    }

    /// Expresión suelta, envuelta en una definición anónima.
    fn top_level(&mut self) -> Parsed<Declaration> {
        let body = self.expression()?;
        let prototype = Prototype {
            name: Located {
                value: String::new(),
                location: body.location.clone(),
            },
            params: Vec::new(),
        };

        Ok(Declaration::Function { prototype, body })
    }

    /// IDENT '(' IDENT* ')', sin separadores entre parámetros.
    fn prototype(&mut self) -> Parsed<Prototype> {
        let name = self.identifier(ParserError::ExpectedFunctionName)?;
        self.expect(Token::Char('('), ParserError::ExpectedParameterList)?;

        let mut params = Vec::new();
        while matches!(self.current.value, Token::Identifier(_)) {
            match self.shift().value {
                Token::Identifier(param) => params.push(param),
                _ => unreachable!(),
            }
        }

        self.expect(Token::Char(')'), ParserError::UnclosedParameterList)?;
        Ok(Prototype { name, params })
    }

    fn expression(&mut self) -> Parsed<Located<Expr>> {
        let lhs = self.primary()?;
        self.binary_rhs(0, lhs)
    }

    /// Ascenso por precedencias sobre una secuencia de operandos.
    fn binary_rhs(&mut self, min: i32, mut lhs: Located<Expr>) -> Parsed<Located<Expr>> {
        loop {
            let precedence = self.precedence();
            if precedence < min {
                return Ok(lhs);
            }

            let op = match self.shift().value {
                Token::Char(op) => op,
                _ => unreachable!(),
            };

            let mut rhs = self.primary()?;
            if precedence < self.precedence() {
                rhs = self.binary_rhs(precedence + 1, rhs)?;
            }

            let location = lhs.location.to(&rhs.location);
            lhs = Located {
                value: Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                location,
            };
        }
    }

    fn precedence(&self) -> i32 {
        match self.current.value {
            Token::Char(op) => binary_precedence(op),
            _ => -1,
        }
    }

    /// La expresión más pequeña reconocible antes del ascenso por
    /// precedencias.
    fn primary(&mut self) -> Parsed<Located<Expr>> {
        match &self.current.value {
            Token::Number(_) => self.number(),
            Token::Identifier(_) => self.call_or_variable(),
            Token::Char('(') => self.parenthesized(),
            Token::If => self.conditional(),
            Token::For => self.for_loop(),
            token => Err(self.expected(ParserError::ExpectedExpression(token.clone()))),
        }
    }

    fn number(&mut self) -> Parsed<Located<Expr>> {
        match self.shift() {
            Located {
                value: Token::Number(value),
                location,
            } => Ok(Located {
                value: Expr::Number { value },
                location,
            }),
            _ => unreachable!(),
        }
    }

    /// Un identificador suelto es una variable; seguido de `(`, una
    /// llamada. El nombre se captura al consumir el token.
    fn call_or_variable(&mut self) -> Parsed<Located<Expr>> {
        let (name, location) = match self.shift() {
            Located {
                value: Token::Identifier(name),
                location,
            } => (name, location),
            _ => unreachable!(),
        };

        if !matches!(self.current.value, Token::Char('(')) {
            return Ok(Located {
                value: Expr::Variable { name },
                location,
            });
        }

        self.shift();
        let mut args = Vec::new();
        if !matches!(self.current.value, Token::Char(')')) {
            loop {
                args.push(self.expression()?);
                match self.current.value {
                    Token::Char(')') => break,
                    Token::Char(',') => {
                        self.shift();
                    }
                    _ => return Err(self.expected(ParserError::BadArgumentList)),
                }
            }
        }

        let close = self.shift();
        let location = location.to(&close.location);
        Ok(Located {
            value: Expr::Call { callee: name, args },
            location,
        })
    }

    /// '(' expression ')'
    fn parenthesized(&mut self) -> Parsed<Located<Expr>> {
        self.shift();
        let contents = self.expression()?;
        self.expect(Token::Char(')'), ParserError::UnclosedParen)?;

        Ok(contents)
    }

    /// 'if' expression 'then' expression 'else' expression
    fn conditional(&mut self) -> Parsed<Located<Expr>> {
        let opening = self.shift();
        let condition = self.expression()?;
        self.expect(Token::Then, ParserError::ExpectedThen)?;
        let then = self.expression()?;
        self.expect(Token::Else, ParserError::ExpectedElse)?;
        let otherwise = self.expression()?;

        let location = opening.location.to(&otherwise.location);
        Ok(Located {
            value: Expr::If {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            location,
        })
    }

    /// 'for' IDENT '=' expression ',' expression (',' expression)?
    /// 'in' expression
    fn for_loop(&mut self) -> Parsed<Located<Expr>> {
        let opening = self.shift();
        let index = self.identifier(ParserError::ExpectedLoopVariable)?.value;
        self.expect(Token::Char('='), ParserError::ExpectedLoopStart)?;
        let start = self.expression()?;
        self.expect(Token::Char(','), ParserError::ExpectedLoopEnd)?;
        let end = self.expression()?;

        let step = if matches!(self.current.value, Token::Char(',')) {
            self.shift();
            self.expression()?
        } else {
            Located {
                value: Expr::Number { value: 1.0 },
                location: end.location.clone(),
            }
        };

        self.expect(Token::In, ParserError::ExpectedIn)?;
        let body = self.expression()?;

        let location = opening.location.to(&body.location);
        Ok(Located {
            value: Expr::For {
                index,
                start: Box::new(start),
                end: Box::new(end),
                step: Box::new(step),
                body: Box::new(body),
            },
            location,
        })
    }

    /// Consume el token actual y avanza el lexer.
    fn shift(&mut self) -> Located<Token> {
        std::mem::replace(&mut self.current, self.lexer.next_token())
    }

    /// Consume un token esperado o falla con el error indicado.
    fn expect(&mut self, token: Token, error: ParserError) -> Parsed<()> {
        if self.current.value == token {
            self.shift();
            Ok(())
        } else {
            Err(self.expected(error))
        }
    }

    /// Consume un identificador o falla con el error indicado.
    fn identifier(&mut self, error: ParserError) -> Parsed<Located<String>> {
        if !matches!(self.current.value, Token::Identifier(_)) {
            return Err(self.expected(error));
        }

        match self.shift() {
            Located {
                value: Token::Identifier(name),
                location,
            } => Ok(Located {
                value: name,
                location,
            }),
            _ => unreachable!(),
        }
    }

    fn expected(&self, error: ParserError) -> Located<ParserError> {
        Located {
            value: error,
            location: self.current.location.clone(),
        }
    }
}

impl Display for Expr {
    /// Forma canónica, completamente parentizada. Volver a analizarla
    /// produce un árbol estructuralmente idéntico.
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number { value } => write!(fmt, "{}", value),
            Expr::Variable { name } => fmt.write_str(name),
            Expr::Binary { op, lhs, rhs } => {
                write!(fmt, "({} {} {})", lhs.value, op, rhs.value)
            }

            Expr::Call { callee, args } => {
                write!(fmt, "{}(", callee)?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        fmt.write_str(", ")?;
                    }
                    write!(fmt, "{}", arg.value)?;
                }
                fmt.write_str(")")
            }

            Expr::If {
                condition,
                then,
                otherwise,
            } => write!(
                fmt,
                "(if {} then {} else {})",
                condition.value, then.value, otherwise.value
            ),

            Expr::For {
                index,
                start,
                end,
                step,
                body,
            } => write!(
                fmt,
                "(for {} = {}, {}, {} in {})",
                index, start.value, end.value, step.value, body.value
            ),
        }
    }
}

impl Display for Prototype {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}(", self.name.value)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                fmt.write_str(" ")?;
            }
            fmt.write_str(param)?;
        }
        fmt.write_str(")")
    }
}

impl Display for Declaration {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Declaration::Prototype(prototype) => write!(fmt, "extern {}", prototype),
            Declaration::Function { prototype, body } if prototype.name.value.is_empty() => {
                write!(fmt, "{}", body.value)
            }
            Declaration::Function { prototype, body } => {
                write!(fmt, "def {} {}", prototype, body.value)
            }
            Declaration::Error(_) => fmt.write_str("<error>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceMap;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn parser(text: &str) -> Parser<'_> {
        Parser::new(Lexer::new(Rc::new(SourceMap::new("<test>", text)), text))
    }

    fn expression(text: &str) -> Located<Expr> {
        match parser(text).parse() {
            Some(Declaration::Function { body, .. }) => body,
            other => panic!("expected a top-level expression, got {:?}", other),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        assert_eq!(expression("1+2*3").value.to_string(), "(1 + (2 * 3))");
        assert_eq!(expression("1*2+3").value.to_string(), "((1 * 2) + 3)");
    }

    #[test]
    fn same_precedence_folds_to_the_left() {
        assert_eq!(expression("1-2-3").value.to_string(), "((1 - 2) - 3)");
        assert_eq!(expression("8/4/2").value.to_string(), "((8 / 4) / 2)");
    }

    #[test]
    fn comparison_binds_loosest() {
        assert_eq!(
            expression("1 < 2 + 3 * 4").value.to_string(),
            "(1 < (2 + (3 * 4)))",
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        assert_eq!(expression("(1+2)*3").value.to_string(), "((1 + 2) * 3)");
    }

    #[test]
    fn call_arguments_are_comma_separated() {
        assert_eq!(
            expression("g(1, x, 2+3)").value.to_string(),
            "g(1, x, (2 + 3))",
        );
        assert_eq!(expression("g()").value.to_string(), "g()");
    }

    #[test]
    fn conditional_has_three_parts() {
        assert_eq!(
            expression("if x < y then y else x").value.to_string(),
            "(if (x < y) then y else x)",
        );
    }

    #[test]
    fn omitted_loop_step_defaults_to_one() {
        assert_eq!(
            expression("for i = 0, i < n in x").value.to_string(),
            "(for i = 0, (i < n), 1 in x)",
        );
    }

    #[test]
    fn explicit_loop_step_is_kept() {
        assert_eq!(
            expression("for i = 10, i, 0 - 1 in f(i)").value.to_string(),
            "(for i = 10, i, (0 - 1) in f(i))",
        );
    }

    #[test]
    fn printing_and_reparsing_is_stable() {
        let sources = [
            "1+2*3-4/5",
            "if a < b then f(a, b) else (for i = a, i < b, 2 in g(i))",
            "x = y = 5",
            "pow(x, 2) + pow(y, 2)",
        ];

        for source in sources {
            let printed = expression(source).value.to_string();
            let reparsed = expression(&printed).value.to_string();
            assert_eq!(printed, reparsed);
        }
    }

    #[test]
    fn definitions_carry_their_prototype() {
        let declaration = parser("def plus(a b) a + b").parse();
        match declaration {
            Some(Declaration::Function { prototype, body }) => {
                assert_eq!(prototype.name.value, "plus");
                assert_eq!(prototype.params, vec!["a", "b"]);
                assert_eq!(body.value.to_string(), "(a + b)");
            }
            other => panic!("expected a definition, got {:?}", other),
        }
    }

    #[test]
    fn externs_are_bodyless() {
        let declaration = parser("extern sin(x)").parse();
        match declaration {
            Some(Declaration::Prototype(prototype)) => {
                assert_eq!(prototype.name.value, "sin");
                assert_eq!(prototype.params, vec!["x"]);
            }
            other => panic!("expected a prototype, got {:?}", other),
        }
    }

    #[test]
    fn bare_expressions_become_anonymous_definitions() {
        let declaration = parser("40 + 2;").parse();
        match declaration {
            Some(Declaration::Function { prototype, .. }) => {
                assert_eq!(prototype.name.value, "");
                assert!(prototype.params.is_empty());
            }
            other => panic!("expected an anonymous definition, got {:?}", other),
        }
    }

    #[test]
    fn errors_consume_the_offending_token() {
        let mut parser = parser("def !; def f() 1;");

        match parser.parse() {
            Some(Declaration::Error(error)) => {
                assert_eq!(error.value, ParserError::ExpectedFunctionName);
            }
            other => panic!("expected a syntax error, got {:?}", other),
        }

        match parser.parse() {
            Some(Declaration::Function { prototype, .. }) => {
                assert_eq!(prototype.name.value, "f");
            }
            other => panic!("expected a definition, got {:?}", other),
        }

        assert!(parser.parse().is_none());
        assert!(parser.reached_end());
    }

    #[test]
    fn missing_close_paren_is_reported() {
        match parser("(1 + 2").parse() {
            Some(Declaration::Error(error)) => {
                assert_eq!(error.value, ParserError::UnclosedParen);
            }
            other => panic!("expected a syntax error, got {:?}", other),
        }
    }

    #[test]
    fn node_spans_cover_the_whole_subtree() {
        let body = expression("1 + 2*3");
        assert_eq!((body.location.start.line, body.location.start.column), (1, 1));
        assert_eq!((body.location.end.line, body.location.end.column), (1, 8));
    }

    #[test]
    fn semicolons_are_ignored_between_declarations() {
        let mut parser = parser(";;; 1 ;;; 2 ;;;");
        assert!(matches!(parser.parse(), Some(Declaration::Function { .. })));
        assert!(matches!(parser.parse(), Some(Declaration::Function { .. })));
        assert!(parser.parse().is_none());
    }
}
