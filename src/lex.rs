//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone el texto fuente
//! en unidades léxicas denominadas tokens. Los espacios en blanco y los
//! comentarios se descartan durante esta operación. Cada token emitido
//! esta asociado a una ubicación en el código fuente original, lo cual
//! permite rastrear errores en tanto los mismos como constructos más
//! elevados de fases posteriores.
//!
//! # Contenido de un token
//! Los identificadores y las constantes numéricas incluyen su lexema o
//! valor directamente en la variante correspondiente. Las palabras clave
//! se identifican por el hecho de lo que son y no incluyen lexemas.
//! Cualquier otro carácter se emite tal cual como [`Token::Char`]; es
//! responsabilidad del parser decidir si tiene sentido.
//!
//! # Reglas importantes del lenguaje
//! - Los identificadores empiezan con una letra y continúan con letras
//!   o dígitos.
//! - Las constantes numéricas son corridas de dígitos y puntos decimales.
//!   La corrida completa se convierte como lo haría `strtod`: el prefijo
//!   válido más largo determina el valor.
//! - Los comentarios comienzan con `#` y terminan con la línea.
//!
//! # Errores
//! Este lexer es total: nunca falla. Un carácter desconocido se emite
//! como token crudo y el error correspondiente, si lo hay, se origina
//! durante el análisis sintáctico.

use crate::source::{Located, Location, Position, SourceMap};
use std::{
    fmt::{self, Display},
    iter::Peekable,
    rc::Rc,
    str::Chars,
};

/// Objeto resultante del análisis léxico.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Fin de la entrada. Se emite indefinidamente una vez alcanzado.
    Eof,

    /// `def`
    Def,

    /// `extern`
    Extern,

    /// `if`
    If,

    /// `then`
    Then,

    /// `else`
    Else,

    /// `for`
    For,

    /// `in`
    In,

    /// Identificador, con su lexema.
    Identifier(String),

    /// Constante numérica, ya convertida.
    Number(f64),

    /// Carácter crudo: puntuación, operadores o basura.
    Char(char),
}

impl Token {
    /// Tabla de palabras reservadas.
    fn keyword(word: &str) -> Option<Token> {
        match word {
            "def" => Some(Token::Def),
            "extern" => Some(Token::Extern),
            "if" => Some(Token::If),
            "then" => Some(Token::Then),
            "else" => Some(Token::Else),
            "for" => Some(Token::For),
            "in" => Some(Token::In),
            _ => None,
        }
    }
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        match self {
            Eof => fmt.write_str("end of input"),
            Def => fmt.write_str("keyword `def`"),
            Extern => fmt.write_str("keyword `extern`"),
            If => fmt.write_str("keyword `if`"),
            Then => fmt.write_str("keyword `then`"),
            Else => fmt.write_str("keyword `else`"),
            For => fmt.write_str("keyword `for`"),
            In => fmt.write_str("keyword `in`"),
            Identifier(name) => write!(fmt, "identifier `{}`", name),
            Number(value) => write!(fmt, "number `{}`", value),
            Char(c) => write!(fmt, "`{}`", c),
        }
    }
}

/// Tokenizador sobre un texto fuente.
///
/// Cada llamada a [`Lexer::next_token`] avanza la entrada en
/// exactamente un token.
pub struct Lexer<'src> {
    source: Peekable<Chars<'src>>,
    from: Rc<SourceMap>,
    next: Position,
}

impl<'src> Lexer<'src> {
    /// Crea un lexer en estado inicial a partir de un texto.
    pub fn new(from: Rc<SourceMap>, text: &'src str) -> Self {
        Lexer {
            source: text.chars().peekable(),
            from,
            next: Position::start(),
        }
    }

    /// Construye el siguiente token.
    pub fn next_token(&mut self) -> Located<Token> {
        loop {
            while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
                self.bump();
            }

            let start = self.next;
            let c = match self.bump() {
                None => return self.locate(Token::Eof, start),
                Some(c) => c,
            };

            let token = match c {
                '#' => {
                    while self.peek().map_or(false, |c| c != '\n' && c != '\r') {
                        self.bump();
                    }
                    continue;
                }

                c if c.is_ascii_alphabetic() => self.word(c),
                c if c.is_ascii_digit() || c == '.' => self.number(c),
                c => Token::Char(c),
            };

            return self.locate(token, start);
        }
    }

    /// Identificador o palabra clave.
    fn word(&mut self, first: char) -> Token {
        let mut word = String::from(first);
        while self.peek().map_or(false, |c| c.is_ascii_alphanumeric()) {
            match self.bump() {
                Some(c) => word.push(c),
                None => unreachable!(),
            }
        }

        Token::keyword(&word).unwrap_or_else(|| Token::Identifier(word))
    }

    /// Constante numérica.
    fn number(&mut self, first: char) -> Token {
        let mut digits = String::from(first);
        while self
            .peek()
            .map_or(false, |c| c.is_ascii_digit() || c == '.')
        {
            match self.bump() {
                Some(c) => digits.push(c),
                None => unreachable!(),
            }
        }

        Token::Number(to_double(&digits))
    }

    fn peek(&mut self) -> Option<char> {
        self.source.peek().copied()
    }

    /// Consume un carácter, actualizando línea y columna. Un CRLF
    /// cuenta como un único terminador de línea.
    fn bump(&mut self) -> Option<char> {
        let c = self.source.next()?;
        if c == '\r' {
            self.source.next_if_eq(&'\n');
        }

        self.next = self.next.after(c);
        Some(c)
    }

    fn locate(&self, token: Token, start: Position) -> Located<Token> {
        let end = match token {
            Token::Eof => start,
            _ => self.next,
        };

        Located {
            value: token,
            location: Location::new(Rc::clone(&self.from), start, end),
        }
    }
}

/// Conversión al estilo de `strtod`: el prefijo válido más largo de la
/// corrida determina el valor, y cero si no hay conversión posible.
fn to_double(digits: &str) -> f64 {
    let mut end = digits.len();
    let mut seen_point = false;
    for (index, c) in digits.char_indices() {
        if c == '.' {
            if seen_point {
                end = index;
                break;
            }
            seen_point = true;
        }
    }

    digits[..end].parse().unwrap_or(0.0)
}
