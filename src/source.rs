//! Rastreo de ubicaciones en el código fuente original.
//!
//! Tokens y nodos del árbol sintáctico llevan consigo el rango del
//! archivo Kaleidoscope del que provienen, lo cual permite señalar el
//! punto exacto o aproximado donde un error de abstracción arbitraria
//! tuvo su origen.
//!
//! El archivo fuente completo se retiene en un [`SourceMap`] que se
//! construye una única vez por invocación del compilador y se comparte
//! por conteo de referencias. De esta manera el renderizado de
//! diagnósticos no necesita releer el archivo ni mantener cachés
//! globales.

use std::{
    fmt::{self, Debug, Display, Formatter},
    mem,
    rc::Rc,
};

/// Un valor del compilador junto al rango de fuente que lo produjo.
#[derive(Debug, Clone)]
pub struct Located<T> {
    pub value: T,
    pub location: Location,
}

/// Rango de posiciones dentro de un origen.
///
/// La posición final es exclusiva: señala la columna inmediatamente
/// después del último carácter del constructo.
#[derive(Clone)]
pub struct Location {
    map: Rc<SourceMap>,
    pub start: Position,
    pub end: Position,
}

impl Location {
    pub fn new(map: Rc<SourceMap>, start: Position, end: Position) -> Self {
        Location { map, start, end }
    }

    /// Extiende esta ubicación hasta el final de otra. Se asume el
    /// mismo origen.
    pub fn to(&self, end: &Location) -> Location {
        Location {
            map: Rc::clone(&self.map),
            start: self.start,
            end: end.end,
        }
    }

    /// Obtiene el origen.
    pub fn source(&self) -> &SourceMap {
        &self.map
    }
}

impl Display for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}:{}:{}-{}:{}",
            self.map.name, self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}

impl Debug for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Línea y columna dentro de un archivo fuente; ambas comienzan en 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    /// Inicio de un archivo.
    pub fn start() -> Position {
        Position { line: 1, column: 1 }
    }

    /// Posición que sigue tras consumir un carácter: un terminador de
    /// línea desciende a la columna 1 de la línea siguiente, cualquier
    /// otro carácter avanza una columna.
    pub fn after(self, c: char) -> Position {
        match c {
            '\n' | '\r' => Position {
                line: self.line + 1,
                column: 1,
            },
            _ => Position {
                line: self.line,
                column: self.column + 1,
            },
        }
    }
}

/// Nombre de origen y líneas del archivo fuente.
///
/// Las líneas se separan al construir, aceptando terminadores
/// LF, CR y CRLF.
#[derive(Debug)]
pub struct SourceMap {
    name: String,
    lines: Vec<String>,
}

impl SourceMap {
    /// Divide un texto fuente en líneas.
    pub fn new<S: Into<String>>(name: S, text: &str) -> Self {
        let mut lines = Vec::new();
        let mut current = String::new();

        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\n' => lines.push(mem::take(&mut current)),
                '\r' => {
                    chars.next_if_eq(&'\n');
                    lines.push(mem::take(&mut current));
                }
                c => current.push(c),
            }
        }

        if !current.is_empty() {
            lines.push(current);
        }

        SourceMap {
            name: name.into(),
            lines,
        }
    }

    /// Obtiene el nombre del origen.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Obtiene una línea por número, comenzando en 1.
    pub fn line(&self, number: u32) -> Option<&str> {
        self.lines
            .get(number.checked_sub(1)? as usize)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lines_split_on_any_terminator() {
        let map = SourceMap::new("<test>", "one\ntwo\rthree\r\nfour");
        assert_eq!(map.line(1), Some("one"));
        assert_eq!(map.line(2), Some("two"));
        assert_eq!(map.line(3), Some("three"));
        assert_eq!(map.line(4), Some("four"));
        assert_eq!(map.line(5), None);
        assert_eq!(map.line(0), None);
    }

    #[test]
    fn positions_follow_line_terminators() {
        let mut position = Position::start();
        for c in "ab\nc".chars() {
            position = position.after(c);
        }

        assert_eq!(position, Position { line: 2, column: 2 });
    }

    #[test]
    fn locations_extend_to_later_positions() {
        let map = Rc::new(SourceMap::new("<test>", "abc def"));
        let first = Location::new(
            Rc::clone(&map),
            Position { line: 1, column: 1 },
            Position { line: 1, column: 4 },
        );
        let second = Location::new(
            Rc::clone(&map),
            Position { line: 1, column: 5 },
            Position { line: 2, column: 1 },
        );

        let merged = first.to(&second);
        assert_eq!(merged.start, Position { line: 1, column: 1 });
        assert_eq!(merged.end, Position { line: 2, column: 1 });
        assert_eq!(merged.to_string(), "<test>:1:1-2:1");
    }
}
