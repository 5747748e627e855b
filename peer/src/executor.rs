//! Task execution seam.
//!
//! The scheduler only sees [`TaskRunner`]: an opaque callable that turns a
//! task into a value or an error within the time budget the scheduler
//! enforces. The bundled [`ExprRunner`] evaluates a small arithmetic language
//! (`f(x) = x * x + 1`) so a deployment is runnable end-to-end without
//! shipping real program code.

use serde_json::Value;

use weft_protocol::TaskSpec;

pub trait TaskRunner: Send + Sync {
    fn run(&self, task: &TaskSpec) -> Result<Value, String>;
}

impl<F> TaskRunner for F
where
    F: Fn(&TaskSpec) -> Result<Value, String> + Send + Sync,
{
    fn run(&self, task: &TaskSpec) -> Result<Value, String> {
        self(task)
    }
}

/// Evaluates programs of the form `name(p1, p2, ...) = expression` — or a
/// bare expression over `x0..xn` (aliases `x`, `y`, `z`) — with `+ - * / %`,
/// unary minus and parentheses.
pub struct ExprRunner;

impl TaskRunner for ExprRunner {
    fn run(&self, task: &TaskSpec) -> Result<Value, String> {
        let numbers: Vec<f64> = task
            .args
            .iter()
            .enumerate()
            .map(|(i, v)| v.as_f64().ok_or_else(|| format!("argument {i} is not a number")))
            .collect::<Result<_, _>>()?;

        let (params, body) = parse_header(&task.program, &task.function)?;
        if let Some(params) = &params {
            if params.len() != numbers.len() {
                return Err(format!(
                    "program takes {} arguments, {} given",
                    params.len(),
                    numbers.len()
                ));
            }
        }

        let lookup = |name: &str| -> Option<f64> {
            if let Some(params) = &params {
                return params.iter().position(|p| p == name).map(|i| numbers[i]);
            }
            let index = match name {
                "x" => 0,
                "y" => 1,
                "z" => 2,
                _ => name.strip_prefix('x')?.parse::<usize>().ok()?,
            };
            numbers.get(index).copied()
        };

        let value = Parser::new(body)?.parse(&lookup)?;
        // Report integral results as integers so `f(7) = 49`, not `49.0`.
        if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
            Ok(Value::from(value as i64))
        } else {
            Ok(Value::from(value))
        }
    }
}

/// Split `name(p1, p2) = body`; returns (params, body). A bare expression has
/// no parameter list.
fn parse_header<'a>(program: &'a str, function: &str) -> Result<(Option<Vec<String>>, &'a str), String> {
    let program = program.trim();
    let Some(eq) = program.find('=') else {
        return Ok((None, program));
    };
    let (head, body) = program.split_at(eq);
    let head = head.trim();
    let body = &body[1..];

    let Some(open) = head.find('(') else {
        return Err("malformed program header".to_string());
    };
    let name = head[..open].trim();
    let rest = head[open + 1..].trim_end();
    let Some(inner) = rest.strip_suffix(')') else {
        return Err("unclosed parameter list".to_string());
    };
    if !function.is_empty() && name != function {
        return Err(format!("function '{function}' not found in program"));
    }
    let params: Vec<String> = inner
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    Ok((Some(params), body))
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Number(f64),
    Ident(&'a str),
    Op(char),
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, String> {
        let mut tokens = Vec::new();
        let bytes = input.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if c.is_ascii_whitespace() {
                i += 1;
            } else if c.is_ascii_digit() || c == '.' {
                let start = i;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &input[start..i];
                let number = text.parse::<f64>().map_err(|_| format!("bad number '{text}'"))?;
                tokens.push(Token::Number(number));
            } else if c.is_ascii_alphabetic() || c == '_' {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(&input[start..i]));
            } else if matches!(c, '+' | '-' | '*' | '/' | '%' | '(' | ')') {
                tokens.push(Token::Op(c));
                i += 1;
            } else {
                return Err(format!("unexpected character '{c}'"));
            }
        }
        Ok(Self { tokens, pos: 0 })
    }

    fn parse(mut self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, String> {
        let value = self.expr(lookup)?;
        if self.pos != self.tokens.len() {
            return Err("trailing tokens in expression".to_string());
        }
        Ok(value)
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, String> {
        let mut left = self.term(lookup)?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let right = self.term(lookup)?;
            left = if op == '+' { left + right } else { left - right };
        }
        Ok(left)
    }

    fn term(&mut self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, String> {
        let mut left = self.factor(lookup)?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let right = self.factor(lookup)?;
            left = match op {
                '*' => left * right,
                '/' if right == 0.0 => return Err("division by zero".to_string()),
                '/' => left / right,
                _ if right == 0.0 => return Err("modulo by zero".to_string()),
                _ => left % right,
            };
        }
        Ok(left)
    }

    fn factor(&mut self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.factor(lookup)?)
            }
            Some(Token::Op('(')) => {
                self.pos += 1;
                let value = self.expr(lookup)?;
                match self.peek() {
                    Some(Token::Op(')')) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                lookup(name).ok_or_else(|| format!("unknown variable '{name}'"))
            }
            _ => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(program: &str, function: &str, args: Vec<Value>) -> Result<Value, String> {
        let task = TaskSpec::new("t", program, function, args);
        ExprRunner.run(&task)
    }

    #[test]
    fn square_function() {
        assert_eq!(run("f(x) = x * x", "f", vec![json!(7)]).unwrap(), json!(49));
    }

    #[test]
    fn increment_function() {
        assert_eq!(run("f(x) = x + 1", "f", vec![json!(10)]).unwrap(), json!(11));
    }

    #[test]
    fn bare_expression_with_positional_vars() {
        assert_eq!(run("x0 + x1 * 2", "", vec![json!(1), json!(3)]).unwrap(), json!(7));
        assert_eq!(run("x + y + z", "", vec![json!(1), json!(2), json!(3)]).unwrap(), json!(6));
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(run("f() = 2 + 3 * 4", "f", vec![]).unwrap(), json!(14));
        assert_eq!(run("f() = (2 + 3) * 4", "f", vec![]).unwrap(), json!(20));
        assert_eq!(run("f(a) = -a % 3", "f", vec![json!(7)]).unwrap(), json!(-1));
    }

    #[test]
    fn fractional_results_stay_floats() {
        assert_eq!(run("f(a) = a / 2", "f", vec![json!(7)]).unwrap(), json!(3.5));
    }

    #[test]
    fn wrong_function_name_is_an_error() {
        let err = run("f(x) = x", "g", vec![json!(1)]).unwrap_err();
        assert!(err.contains("'g' not found"), "got: {err}");
    }

    #[test]
    fn arity_and_argument_type_checks() {
        assert!(run("f(a, b) = a + b", "f", vec![json!(1)]).is_err());
        assert!(run("f(a) = a", "f", vec![json!("seven")]).is_err());
    }

    #[test]
    fn division_by_zero_fails_the_task() {
        let err = run("f(a) = 1 / (a - a)", "f", vec![json!(5)]).unwrap_err();
        assert!(err.contains("division by zero"));
    }

    #[test]
    fn unknown_variable_is_reported() {
        let err = run("q + 1", "", vec![json!(1)]).unwrap_err();
        assert!(err.contains("unknown variable 'q'"));
    }
}
