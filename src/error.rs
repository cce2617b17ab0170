use crate::source::{Located, Location};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Un error de cualquier fase junto a su encabezado y ubicación.
pub struct Diagnostic {
    header: &'static str,
    message: Box<dyn Error + 'static>,
    location: Location,
}

impl Diagnostic {
    pub fn new<E: Error + 'static>(header: &'static str, error: Located<E>) -> Self {
        Diagnostic {
            header,
            message: Box::new(error.value),
            location: error.location,
        }
    }
}

/// Colección de diagnósticos acumulados durante una compilación.
#[derive(Default)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostics(errors) = self;
        if errors.is_empty() {
            return writeln!(fmt, "No errors were reported");
        }

        for error in errors {
            let location = &error.location;
            writeln!(fmt, "{}: {}: {}", location, error.header, error.message)?;

            let start = location.start;
            let end = location.end;
            let digits = end.line.to_string().chars().count();

            if let Some(line) = location.source().line(start.line) {
                writeln!(fmt, "{:>digits$} | {}", start.line, line, digits = digits)?;

                let skip = start.column.saturating_sub(1) as usize;
                writeln!(
                    fmt,
                    "{:digits$} | {:skip$}^",
                    "",
                    "",
                    digits = digits,
                    skip = skip
                )?;
            }

            for number in start.line + 1..=end.line {
                if let Some(line) = location.source().line(number) {
                    writeln!(fmt, "{:>digits$} | {}", number, line, digits = digits)?;
                }
            }

            writeln!(fmt)?;
        }

        let error_or_errors = if errors.len() == 1 { "error" } else { "errors" };
        writeln!(fmt, "{} {} emitted", errors.len(), error_or_errors)
    }
}
