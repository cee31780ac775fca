//! Environment markers
//!
//! Parses the condition after `;` in a dependency string and evaluates it
//! against an environment derived from the download target.

use super::version::{Version, VersionSpecifier};
use crate::error::{WheelhouseError, WheelhouseResult};
use wheelhouse_types::Target;

/// Variables a marker may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerVariable {
    PythonVersion,
    PythonFullVersion,
    SysPlatform,
    OsName,
    PlatformSystem,
    PlatformMachine,
    PlatformRelease,
    PlatformVersion,
    ImplementationName,
    ImplementationVersion,
    PlatformPythonImplementation,
    Extra,
}

impl MarkerVariable {
    fn from_name(name: &str) -> Option<Self> {
        let var = match name {
            "python_version" => MarkerVariable::PythonVersion,
            "python_full_version" => MarkerVariable::PythonFullVersion,
            "sys_platform" | "sys.platform" => MarkerVariable::SysPlatform,
            "os_name" | "os.name" => MarkerVariable::OsName,
            "platform_system" => MarkerVariable::PlatformSystem,
            "platform_machine" | "platform.machine" => MarkerVariable::PlatformMachine,
            "platform_release" => MarkerVariable::PlatformRelease,
            "platform_version" | "platform.version" => MarkerVariable::PlatformVersion,
            "implementation_name" => MarkerVariable::ImplementationName,
            "implementation_version" => MarkerVariable::ImplementationVersion,
            "platform_python_implementation" | "platform.python_implementation" => {
                MarkerVariable::PlatformPythonImplementation
            }
            "extra" => MarkerVariable::Extra,
            _ => return None,
        };
        Some(var)
    }
}

/// Values the marker variables take for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEnvironment {
    pub python_version: String,
    pub python_full_version: String,
    pub sys_platform: String,
    pub os_name: String,
    pub platform_system: String,
    pub platform_machine: String,
    pub implementation_name: String,
    pub platform_python_implementation: String,
}

impl MarkerEnvironment {
    /// Derive the environment from a runtime version and platform tag.
    ///
    /// `any` is evaluated as a Linux target.
    pub fn from_target(target: &Target) -> Self {
        let full = target.python_version.trim().to_string();
        let short = full.split('.').take(2).collect::<Vec<_>>().join(".");

        let tag = target.platform.to_ascii_lowercase();
        let (sys_platform, os_name, system) = if tag.starts_with("win") {
            ("win32", "nt", "Windows")
        } else if tag.starts_with("macosx") {
            ("darwin", "posix", "Darwin")
        } else {
            ("linux", "posix", "Linux")
        };

        Self {
            python_version: short,
            python_full_version: full,
            sys_platform: sys_platform.to_string(),
            os_name: os_name.to_string(),
            platform_system: system.to_string(),
            platform_machine: machine_from_tag(&tag),
            implementation_name: "cpython".to_string(),
            platform_python_implementation: "CPython".to_string(),
        }
    }

    /// Value of a variable; `None` for `extra`, which is never set
    fn get(&self, var: MarkerVariable) -> Option<&str> {
        let value = match var {
            MarkerVariable::PythonVersion => &self.python_version,
            MarkerVariable::PythonFullVersion | MarkerVariable::ImplementationVersion => {
                &self.python_full_version
            }
            MarkerVariable::SysPlatform => &self.sys_platform,
            MarkerVariable::OsName => &self.os_name,
            MarkerVariable::PlatformSystem => &self.platform_system,
            MarkerVariable::PlatformMachine => &self.platform_machine,
            MarkerVariable::PlatformRelease | MarkerVariable::PlatformVersion => "",
            MarkerVariable::ImplementationName => &self.implementation_name,
            MarkerVariable::PlatformPythonImplementation => &self.platform_python_implementation,
            MarkerVariable::Extra => return None,
        };
        Some(value)
    }
}

fn machine_from_tag(tag: &str) -> String {
    match tag {
        "win_amd64" => return "AMD64".to_string(),
        "win32" => return "x86".to_string(),
        "win_arm64" => return "ARM64".to_string(),
        "any" => return String::new(),
        _ => {}
    }

    // Compressed tag sets share the architecture; use the first
    let first = tag.split('.').next().unwrap_or(tag);
    for arch in ["x86_64", "aarch64", "arm64", "i686", "ppc64le", "s390x", "armv7l", "universal2"] {
        if first.ends_with(arch) {
            return arch.to_string();
        }
    }
    first.rsplit('_').next().unwrap_or_default().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerValue {
    Variable(MarkerVariable),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Compatible,
    ArbitraryEqual,
    In,
    NotIn,
}

impl MarkerOperator {
    fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol {
            "==" => MarkerOperator::Equal,
            "!=" => MarkerOperator::NotEqual,
            "<" => MarkerOperator::LessThan,
            "<=" => MarkerOperator::LessThanEqual,
            ">" => MarkerOperator::GreaterThan,
            ">=" => MarkerOperator::GreaterThanEqual,
            "~=" => MarkerOperator::Compatible,
            "===" => MarkerOperator::ArbitraryEqual,
            _ => return None,
        };
        Some(op)
    }

    fn symbol(self) -> &'static str {
        match self {
            MarkerOperator::Equal => "==",
            MarkerOperator::NotEqual => "!=",
            MarkerOperator::LessThan => "<",
            MarkerOperator::LessThanEqual => "<=",
            MarkerOperator::GreaterThan => ">",
            MarkerOperator::GreaterThanEqual => ">=",
            MarkerOperator::Compatible => "~=",
            MarkerOperator::ArbitraryEqual => "===",
            MarkerOperator::In => "in",
            MarkerOperator::NotIn => "not in",
        }
    }
}

/// A single `lhs op rhs` comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerExpression {
    pub lhs: MarkerValue,
    pub operator: MarkerOperator,
    pub rhs: MarkerValue,
}

impl MarkerExpression {
    fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        let resolve = |value: &MarkerValue| match value {
            MarkerValue::Variable(var) => env.get(*var).map(str::to_string),
            MarkerValue::Literal(text) => Some(text.clone()),
        };

        // Extras are opt-in dependency sets and are never enabled
        let (Some(lhs), Some(rhs)) = (resolve(&self.lhs), resolve(&self.rhs)) else {
            return false;
        };

        match self.operator {
            MarkerOperator::In => rhs.contains(&lhs),
            MarkerOperator::NotIn => !rhs.contains(&lhs),
            op => compare(&lhs, op, &rhs),
        }
    }
}

/// Version semantics when both sides are versions, string semantics otherwise
fn compare(lhs: &str, op: MarkerOperator, rhs: &str) -> bool {
    if let (Ok(version), Ok(spec)) = (
        Version::parse(lhs),
        VersionSpecifier::parse(&format!("{}{}", op.symbol(), rhs)),
    ) {
        return spec.contains(&version);
    }

    match op {
        MarkerOperator::Equal | MarkerOperator::ArbitraryEqual => lhs == rhs,
        MarkerOperator::NotEqual => lhs != rhs,
        MarkerOperator::LessThan => lhs < rhs,
        MarkerOperator::LessThanEqual => lhs <= rhs,
        MarkerOperator::GreaterThan => lhs > rhs,
        MarkerOperator::GreaterThanEqual => lhs >= rhs,
        _ => false,
    }
}

/// Parsed marker: a boolean tree of comparisons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerTree {
    Expression(MarkerExpression),
    And(Vec<MarkerTree>),
    Or(Vec<MarkerTree>),
}

impl MarkerTree {
    pub fn parse(input: &str) -> WheelhouseResult<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let tree = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(tree)
    }

    pub fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        match self {
            MarkerTree::Expression(expr) => expr.evaluate(env),
            MarkerTree::And(children) => children.iter().all(|c| c.evaluate(env)),
            MarkerTree::Or(children) => children.iter().any(|c| c.evaluate(env)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Ident(String),
    Str(String),
    Op(String),
}

fn tokenize(input: &str) -> WheelhouseResult<Vec<Token>> {
    let error = |reason: &str| WheelhouseError::InvalidMarker {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    text.push(ch);
                }
                if !closed {
                    return Err(error("unterminated string"));
                }
                tokens.push(Token::Str(text));
            }
            '=' | '<' | '>' | '!' | '~' => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if !matches!(ch, '=' | '<' | '>' | '!' | '~') {
                        break;
                    }
                    end = i + ch.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Op(input[start..end].to_string()));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '.') {
                        break;
                    }
                    end = i + ch.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Ident(input[start..end].to_string()));
            }
            _ => return Err(error(&format!("unexpected character '{}'", c))),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> WheelhouseError {
        WheelhouseError::InvalidMarker {
            input: self.input.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(word)) if word == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> WheelhouseResult<MarkerTree> {
        let mut branches = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            branches.push(self.parse_and()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            MarkerTree::Or(branches)
        })
    }

    fn parse_and(&mut self) -> WheelhouseResult<MarkerTree> {
        let mut terms = vec![self.parse_atom()?];
        while self.eat_keyword("and") {
            terms.push(self.parse_atom()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            MarkerTree::And(terms)
        })
    }

    fn parse_atom(&mut self) -> WheelhouseResult<MarkerTree> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }

        let lhs = self.parse_value()?;
        let operator = self.parse_operator()?;
        let rhs = self.parse_value()?;
        Ok(MarkerTree::Expression(MarkerExpression { lhs, operator, rhs }))
    }

    fn parse_value(&mut self) -> WheelhouseResult<MarkerValue> {
        match self.next() {
            Some(Token::Str(text)) => Ok(MarkerValue::Literal(text)),
            Some(Token::Ident(name)) => MarkerVariable::from_name(&name)
                .map(MarkerValue::Variable)
                .ok_or_else(|| self.error(&format!("unknown variable '{}'", name))),
            _ => Err(self.error("expected a variable or a quoted string")),
        }
    }

    fn parse_operator(&mut self) -> WheelhouseResult<MarkerOperator> {
        match self.next() {
            Some(Token::Op(symbol)) => MarkerOperator::from_symbol(&symbol)
                .ok_or_else(|| self.error(&format!("unknown operator '{}'", symbol))),
            Some(Token::Ident(word)) if word == "in" => Ok(MarkerOperator::In),
            Some(Token::Ident(word)) if word == "not" => {
                if self.eat_keyword("in") {
                    Ok(MarkerOperator::NotIn)
                } else {
                    Err(self.error("expected 'in' after 'not'"))
                }
            }
            _ => Err(self.error("expected a comparison operator")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(python: &str, platform: &str) -> MarkerEnvironment {
        MarkerEnvironment::from_target(&Target::new(python, platform))
    }

    fn eval(marker: &str, env: &MarkerEnvironment) -> bool {
        MarkerTree::parse(marker).unwrap().evaluate(env)
    }

    #[test]
    fn test_environment_from_target() {
        let win = env("3.11.4", "win_amd64");
        assert_eq!(win.python_version, "3.11");
        assert_eq!(win.python_full_version, "3.11.4");
        assert_eq!(win.sys_platform, "win32");
        assert_eq!(win.os_name, "nt");
        assert_eq!(win.platform_machine, "AMD64");

        let linux = env("3.12", "manylinux_2_17_aarch64.manylinux2014_aarch64");
        assert_eq!(linux.sys_platform, "linux");
        assert_eq!(linux.platform_machine, "aarch64");

        let mac = env("3.10", "macosx_11_0_arm64");
        assert_eq!(mac.sys_platform, "darwin");
        assert_eq!(mac.platform_system, "Darwin");
        assert_eq!(mac.platform_machine, "arm64");

        let any = env("3.11", "any");
        assert_eq!(any.sys_platform, "linux");
        assert_eq!(any.os_name, "posix");
    }

    #[test]
    fn test_platform_markers() {
        let linux = env("3.11", "linux");
        let win = env("3.11", "win_amd64");
        assert!(!eval("sys_platform == 'win32'", &linux));
        assert!(eval("sys_platform == 'win32'", &win));
        assert!(eval("os_name != \"nt\"", &linux));
        assert!(eval("platform_system == 'Windows' or sys_platform == 'darwin'", &win));
    }

    #[test]
    fn test_version_markers_compare_as_versions() {
        let py311 = env("3.11", "any");
        assert!(eval("python_version >= '3.8'", &py311));
        // string comparison would get this wrong
        assert!(eval("python_version > '3.9'", &py311));
        assert!(!eval("python_version < '3.10'", &py311));
        assert!(eval("'3.7' <= python_version", &py311));
        assert!(eval("python_full_version ~= '3.11.0'", &py311));
    }

    #[test]
    fn test_boolean_structure_and_parens() {
        let py38_win = env("3.8", "win32");
        assert!(eval(
            "python_version < '3.9' and (sys_platform == 'win32' or sys_platform == 'cygwin')",
            &py38_win
        ));
        assert!(!eval(
            "python_version >= '3.9' and sys_platform == 'win32'",
            &py38_win
        ));
        assert!(eval("platform_machine in 'x86 AMD64'", &py38_win));
        assert!(!eval("platform_machine not in 'x86 AMD64'", &py38_win));
    }

    #[test]
    fn test_extra_is_never_satisfied() {
        let e = env("3.11", "any");
        assert!(!eval("extra == 'socks'", &e));
        assert!(!eval("extra != 'socks'", &e));
        assert!(!eval("python_version >= '3' and extra == 'test'", &e));
        assert!(eval("python_version >= '3' or extra == 'test'", &e));
    }

    #[test]
    fn test_parse_errors() {
        assert!(MarkerTree::parse("python_version >=").is_err());
        assert!(MarkerTree::parse("bogus_variable == '1'").is_err());
        assert!(MarkerTree::parse("python_version == '3.8").is_err());
        assert!(MarkerTree::parse("(python_version == '3.8'").is_err());
        assert!(MarkerTree::parse("python_version <> '3.8'").is_err());
        assert!(MarkerTree::parse("python_version == '3.8' os_name").is_err());
    }
}
