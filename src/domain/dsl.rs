//! Recharge condition expression language (spec §4.B).
//!
//! A small recursive-descent parser over `identifier '(' args ')'` forms,
//! producing a pure [`Expr`] AST. Evaluation is side-effect-free except for
//! the predicates that need to ask something external (`quota-le`,
//! `belong-to`, `github-star`'s global toggle), which go through the
//! [`ConditionContext`] trait so new predicates stay additive (spec §9
//! "DSL extensibility").

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum DslError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("expected '{0}'")]
    Expected(char),
    #[error("invalid numeric literal: {0}")]
    BadNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    True,
    False,
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Call(String, Vec<Literal>),
}

/// Parses condition text into an [`Expr`]. An empty (or all-whitespace)
/// string parses to [`Expr::True`], matching every user.
pub fn parse(text: &str) -> Result<Expr, DslError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Expr::True);
    }
    let mut parser = Parser {
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(DslError::UnexpectedChar(parser.chars[parser.pos], parser.pos));
    }
    Ok(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expect(&mut self, c: char) -> Result<(), DslError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(DslError::Expected(c))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, DslError> {
        self.skip_ws();
        let name = self.parse_identifier()?;
        self.expect('(')?;
        let args = self.parse_args(&name)?;
        self.expect(')')?;

        Ok(match name.as_str() {
            "true" => Expr::True,
            "false" => Expr::False,
            "and" => Expr::And(args.into_exprs()?),
            "or" => Expr::Or(args.into_exprs()?),
            "not" => {
                let mut exprs = args.into_exprs()?;
                if exprs.len() != 1 {
                    return Err(DslError::UnexpectedEnd);
                }
                Expr::Not(Box::new(exprs.remove(0)))
            }
            _ => Expr::Call(name, args.into_literals()?),
        })
    }

    fn parse_identifier(&mut self) -> Result<String, DslError> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.err_here());
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_args(&mut self, fn_name: &str) -> Result<Args, DslError> {
        let is_combinator = matches!(fn_name, "and" | "or" | "not");
        let mut exprs = Vec::new();
        let mut literals = Vec::new();

        self.skip_ws();
        if self.peek() == Some(')') {
            return Ok(Args { exprs, literals });
        }

        loop {
            self.skip_ws();
            if is_combinator {
                exprs.push(self.parse_expr()?);
            } else {
                literals.push(self.parse_literal()?);
            }
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                _ => break,
            }
        }
        Ok(Args { exprs, literals })
    }

    fn parse_literal(&mut self) -> Result<Literal, DslError> {
        self.skip_ws();
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != '"') {
                    self.pos += 1;
                }
                if self.peek() != Some('"') {
                    return Err(DslError::Expected('"'));
                }
                let s: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                Ok(Literal::Str(s))
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let start = self.pos;
                self.pos += 1;
                while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let raw: String = self.chars[start..self.pos].iter().collect();
                raw.parse::<f64>()
                    .map(Literal::Num)
                    .map_err(|_| DslError::BadNumber(raw))
            }
            _ => Err(self.err_here()),
        }
    }

    fn err_here(&self) -> DslError {
        match self.chars.get(self.pos) {
            Some(c) => DslError::UnexpectedChar(*c, self.pos),
            None => DslError::UnexpectedEnd,
        }
    }
}

struct Args {
    exprs: Vec<Expr>,
    literals: Vec<Literal>,
}

impl Args {
    fn into_exprs(self) -> Result<Vec<Expr>, DslError> {
        Ok(self.exprs)
    }

    fn into_literals(self) -> Result<Vec<Literal>, DslError> {
        Ok(self.literals)
    }
}

/// The user-shaped facts the DSL evaluates against.
pub struct EvalUser {
    pub id: String,
    pub registered_at: DateTime<Utc>,
    pub last_access_at: Option<DateTime<Utc>>,
    pub vip_level: i64,
    pub starred_projects: String,
    pub company: Option<String>,
}

/// The pluggable querier interface: the only side-effecting seam in the DSL.
#[async_trait]
pub trait ConditionContext: Send + Sync {
    fn timezone(&self) -> Tz;
    fn hr_sync_enabled(&self) -> bool;
    /// Whether `github_star_check.enabled` is set (spec §6); when false,
    /// `github-star()` is gated off and always matches.
    fn github_star_check_enabled(&self) -> bool;
    /// `github_star_check.required_repo` (spec §6), used when `github-star()`
    /// is called with no explicit repo argument.
    fn required_repo(&self) -> &str;
    async fn department_path(&self, user_id: &str) -> Option<Vec<String>>;
    async fn quota_remaining(&self, user_id: &str, model_or_star: &str) -> Option<f64>;
}

/// Evaluates `expr` against `user`. Unknown functions or type mismatches
/// make the predicate false for this (strategy, user) and are logged, never
/// propagated as a hard error — spec §4.B.
pub async fn evaluate(expr: &Expr, user: &EvalUser, ctx: &dyn ConditionContext) -> bool {
    match expr {
        Expr::True => true,
        Expr::False => false,
        Expr::And(parts) => {
            for part in parts {
                if !Box::pin(evaluate(part, user, ctx)).await {
                    return false;
                }
            }
            true
        }
        Expr::Or(parts) => {
            for part in parts {
                if Box::pin(evaluate(part, user, ctx)).await {
                    return true;
                }
            }
            false
        }
        Expr::Not(inner) => !Box::pin(evaluate(inner, user, ctx)).await,
        Expr::Call(name, args) => eval_call(name, args, user, ctx).await,
    }
}

async fn eval_call(name: &str, args: &[Literal], user: &EvalUser, ctx: &dyn ConditionContext) -> bool {
    match name {
        "match-user" => args.iter().any(|lit| matches!(lit, Literal::Str(s) if s == &user.id)),
        "register-before" => match single_str(args) {
            Some(text) => match parse_local_datetime(text, ctx.timezone()) {
                Some(cutoff) => user.registered_at < cutoff,
                None => {
                    warn!(function = name, text, "could not parse timestamp literal");
                    false
                }
            },
            None => {
                warn!(function = name, "expected a single string literal");
                false
            }
        },
        "access-after" => match (single_str(args), user.last_access_at) {
            (Some(text), Some(last_access)) => match parse_local_datetime(text, ctx.timezone()) {
                Some(cutoff) => last_access > cutoff,
                None => {
                    warn!(function = name, text, "could not parse timestamp literal");
                    false
                }
            },
            _ => false,
        },
        "is-vip" => match single_num(args) {
            Some(level) => user.vip_level as f64 >= level,
            None => {
                warn!(function = name, "expected a single numeric literal");
                false
            }
        },
        "github-star" => {
            if !ctx.github_star_check_enabled() {
                return true;
            }
            let repo = match (single_str(args), args.is_empty()) {
                (Some(repo), _) => repo,
                (None, true) => ctx.required_repo(),
                (None, false) => {
                    warn!(function = name, "expected a single string literal");
                    return false;
                }
            };
            user
                .starred_projects
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == repo.trim())
        }
        "belong-to" => {
            if ctx.hr_sync_enabled() {
                match ctx.department_path(&user.id).await {
                    Some(path) => args.iter().any(|lit| {
                        matches!(lit, Literal::Str(dept) if path.iter().any(|p| p == dept))
                    }),
                    None => false,
                }
            } else {
                match &user.company {
                    Some(company) => args
                        .iter()
                        .any(|lit| matches!(lit, Literal::Str(dept) if dept == company)),
                    None => false,
                }
            }
        }
        "quota-le" => {
            let Some((model, amount)) = two_args_str_num(args) else {
                warn!(function = name, "expected (string, number) arguments");
                return false;
            };
            match ctx.quota_remaining(&user.id, model).await {
                Some(remaining) => remaining <= amount,
                None => false,
            }
        }
        other => {
            warn!(function = other, "unknown predicate; treating as false");
            false
        }
    }
}

fn single_str(args: &[Literal]) -> Option<&str> {
    match args {
        [Literal::Str(s)] => Some(s.as_str()),
        _ => None,
    }
}

fn single_num(args: &[Literal]) -> Option<f64> {
    match args {
        [Literal::Num(n)] => Some(*n),
        _ => None,
    }
}

fn two_args_str_num(args: &[Literal]) -> Option<(&str, f64)> {
    match args {
        [Literal::Str(s), Literal::Num(n)] => Some((s.as_str(), *n)),
        _ => None,
    }
}

fn parse_local_datetime(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok()?;
    tz.from_local_datetime(&naive).single().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullContext;

    #[async_trait]
    impl ConditionContext for NullContext {
        fn timezone(&self) -> Tz {
            chrono_tz::UTC
        }
        fn hr_sync_enabled(&self) -> bool {
            false
        }
        fn github_star_check_enabled(&self) -> bool {
            true
        }
        fn required_repo(&self) -> &str {
            ""
        }
        async fn department_path(&self, _user_id: &str) -> Option<Vec<String>> {
            None
        }
        async fn quota_remaining(&self, _user_id: &str, _model: &str) -> Option<f64> {
            Some(0.0)
        }
    }

    struct ConfiguredContext {
        enabled: bool,
        required_repo: &'static str,
    }

    #[async_trait]
    impl ConditionContext for ConfiguredContext {
        fn timezone(&self) -> Tz {
            chrono_tz::UTC
        }
        fn hr_sync_enabled(&self) -> bool {
            false
        }
        fn github_star_check_enabled(&self) -> bool {
            self.enabled
        }
        fn required_repo(&self) -> &str {
            self.required_repo
        }
        async fn department_path(&self, _user_id: &str) -> Option<Vec<String>> {
            None
        }
        async fn quota_remaining(&self, _user_id: &str, _model: &str) -> Option<f64> {
            Some(0.0)
        }
    }

    fn user(id: &str) -> EvalUser {
        EvalUser {
            id: id.to_string(),
            registered_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_access_at: None,
            vip_level: 2,
            starred_projects: "anthropics/claude-code, foo/bar".to_string(),
            company: Some("Engineering".to_string()),
        }
    }

    #[tokio::test]
    async fn empty_text_matches_everyone() {
        let expr = parse("").unwrap();
        assert!(evaluate(&expr, &user("u1"), &NullContext).await);
    }

    #[tokio::test]
    async fn and_or_not_compose() {
        let expr = parse(r#"and(true(), or(false(), not(false())))"#).unwrap();
        assert!(evaluate(&expr, &user("u1"), &NullContext).await);
    }

    #[tokio::test]
    async fn match_user_checks_membership() {
        let expr = parse(r#"match-user("u1", "u2")"#).unwrap();
        assert!(evaluate(&expr, &user("u1"), &NullContext).await);
        assert!(!evaluate(&expr, &user("u3"), &NullContext).await);
    }

    #[tokio::test]
    async fn github_star_is_trimmed_and_case_sensitive() {
        let expr = parse(r#"github-star("anthropics/claude-code")"#).unwrap();
        assert!(evaluate(&expr, &user("u1"), &NullContext).await);
        let expr = parse(r#"github-star("Anthropics/Claude-Code")"#).unwrap();
        assert!(!evaluate(&expr, &user("u1"), &NullContext).await);
    }

    #[tokio::test]
    async fn github_star_passes_when_globally_disabled() {
        let ctx = ConfiguredContext {
            enabled: false,
            required_repo: "anthropics/claude-code",
        };
        let expr = parse(r#"github-star("some/other-repo")"#).unwrap();
        assert!(evaluate(&expr, &user("u1"), &ctx).await);
    }

    #[tokio::test]
    async fn github_star_falls_back_to_required_repo_with_no_argument() {
        let ctx = ConfiguredContext {
            enabled: true,
            required_repo: "anthropics/claude-code",
        };
        let expr = parse("github-star()").unwrap();
        assert!(evaluate(&expr, &user("u1"), &ctx).await);

        let ctx = ConfiguredContext {
            enabled: true,
            required_repo: "foo/not-starred",
        };
        let expr = parse("github-star()").unwrap();
        assert!(!evaluate(&expr, &user("u1"), &ctx).await);
    }

    #[tokio::test]
    async fn is_vip_compares_rank() {
        let expr = parse("is-vip(2)").unwrap();
        assert!(evaluate(&expr, &user("u1"), &NullContext).await);
        let expr = parse("is-vip(3)").unwrap();
        assert!(!evaluate(&expr, &user("u1"), &NullContext).await);
    }

    #[tokio::test]
    async fn unknown_function_fails_closed() {
        let expr = parse(r#"nonsense("x")"#).unwrap();
        assert!(!evaluate(&expr, &user("u1"), &NullContext).await);
    }
}
