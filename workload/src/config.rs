//! Line-oriented workload configuration files
//!
//! Each non-blank line of a config file holds one option: a `-`, a single
//! option character, then the option's argument if it takes one.
//!
//! ```text
//! -j 1000
//! -D 0.25
//! ```
//!
//! Lines that do not follow this syntax, or that use an option which the
//! workload does not know about, are reported as bad lines carrying the raw
//! line content.

use crate::{InitError, ResourceError};
use loadgen::SquareWaveError;
use std::{
    fmt::{self, Display},
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
    str::FromStr,
};
use thiserror::Error;

/// Options recognized by a workload, in getopt notation
///
/// Every option is a single character. A character followed by `:` takes a
/// required argument, so `"j:v"` describes an option `-j <arg>` and a flag
/// `-v`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OptionSet<'spec>(&'spec str);
//
impl<'spec> OptionSet<'spec> {
    /// Describe a set of options
    pub const fn new(spec: &'spec str) -> Self {
        Self(spec)
    }

    /// Truth that an option takes an argument, or None if it is unknown
    pub fn lookup(&self, name: char) -> Option<bool> {
        if name == ':' {
            return None;
        }
        let mut chars = self.0.chars().peekable();
        while let Some(option) = chars.next() {
            let takes_argument = chars.next_if_eq(&':').is_some();
            if option == name {
                return Some(takes_argument);
            }
        }
        None
    }
}

/// Recognized option from a config file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigOption {
    /// Option character
    pub name: char,

    /// Argument, if the option takes one and it was provided
    pub argument: Option<Box<str>>,
}
//
impl ConfigOption {
    /// Parse the argument of this option
    pub fn value<T>(&self) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        parse_value(self.name, self.argument.as_deref())
    }
}
//
impl Display for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}", self.name)?;
        if let Some(argument) = &self.argument {
            write!(f, " {argument}")?;
        }
        Ok(())
    }
}

/// Parsed line of a config file
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigLine {
    /// Recognized option
    Option(ConfigOption),

    /// Line that is not a recognized option, reported as-is
    BadLine(Box<str>),
}

/// Parse one line of a config file, or return None if it is blank
pub fn parse_line(line: &str, options: OptionSet) -> Option<ConfigLine> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let bad_line = || Some(ConfigLine::BadLine(line.into()));
    let Some(rest) = trimmed.strip_prefix('-') else {
        return bad_line();
    };
    let mut chars = rest.chars();
    let Some(name) = chars.next() else {
        return bad_line();
    };
    let Some(takes_argument) = options.lookup(name) else {
        return bad_line();
    };
    let argument = if takes_argument {
        Some(chars.as_str().trim())
            .filter(|argument| !argument.is_empty())
            .map(Box::from)
    } else {
        None
    };
    Some(ConfigLine::Option(ConfigOption { name, argument }))
}

/// Parse every line of a config file, in file order
///
/// Lines that are not valid UTF-8 are bad lines, reported lossily.
pub fn parse(reader: impl BufRead, options: OptionSet) -> io::Result<Vec<ConfigLine>> {
    let mut result = Vec::new();
    for line in reader.split(b'\n') {
        let line = line?;
        let line = line.strip_suffix(b"\r").unwrap_or(&line);
        match std::str::from_utf8(line) {
            Ok(line) => result.extend(parse_line(line, options)),
            Err(_) => result.push(ConfigLine::BadLine(
                String::from_utf8_lossy(line).into_owned().into(),
            )),
        }
    }
    Ok(result)
}

/// Load the options of a config file, rejecting bad lines
pub fn load(path: &Path, options: OptionSet) -> Result<Vec<ConfigOption>, InitError> {
    let io_error = |source| ResourceError::ConfigFile {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;
    let lines = parse(BufReader::new(file), options).map_err(io_error)?;
    lines
        .into_iter()
        .map(|line| match line {
            ConfigLine::Option(option) => Ok(option),
            ConfigLine::BadLine(line) => Err(ConfigError::BadLine(line).into()),
        })
        .collect()
}

/// Parse an option argument, which must be present
pub fn parse_value<T>(option: char, argument: Option<&str>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let argument = argument.ok_or(ConfigError::MissingArgument(option))?;
    argument
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            option,
            value: argument.into(),
            reason: e.to_string(),
        })
}

/// Invalid workload configuration
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Line is not a recognized option
    #[error("config file contains bad line {0:?}")]
    BadLine(Box<str>),

    /// Option that takes an argument was provided without one
    #[error("option -{0} requires an argument")]
    MissingArgument(char),

    /// Option argument could not be parsed or is out of range
    #[error("invalid value {value:?} for option -{option} ({reason})")]
    InvalidValue {
        /// Option character
        option: char,

        /// Raw argument
        value: Box<str>,

        /// Why the argument was rejected
        reason: String,
    },

    /// Square wave parameters are inconsistent
    #[error("invalid square wave ({0})")]
    SquareWave(#[from] SquareWaveError),
}
