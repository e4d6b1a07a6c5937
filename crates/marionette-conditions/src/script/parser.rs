use std::sync::OnceLock;

use pest::error::LineColLocation;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser as PestParser;

use super::ast::{AssignOp, BinaryOp, Expr, Place, Stmt, StmtKind, UnaryOp};
use crate::error::CompileError;

#[derive(PestParser)]
#[grammar = "src/script/grammar.pest"]
struct ScriptParser;

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        // Lowest precedence first
        PrattParser::new()
            .op(Op::infix(Rule::or_op, Assoc::Left))
            .op(Op::infix(Rule::and_op, Assoc::Left))
            .op(Op::prefix(Rule::not_op))
            .op(Op::infix(Rule::eq, Assoc::Left) | Op::infix(Rule::ne, Assoc::Left))
            .op(Op::infix(Rule::lt, Assoc::Left)
                | Op::infix(Rule::le, Assoc::Left)
                | Op::infix(Rule::gt, Assoc::Left)
                | Op::infix(Rule::ge, Assoc::Left))
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left)
                | Op::infix(Rule::div, Assoc::Left)
                | Op::infix(Rule::rem, Assoc::Left))
            .op(Op::prefix(Rule::neg) | Op::prefix(Rule::bang))
            .op(Op::postfix(Rule::call_args)
                | Op::postfix(Rule::field_access)
                | Op::postfix(Rule::index_access))
    })
}

/// Parse condition source into its statement list.
///
/// # Errors
/// Returns `CompileError::Syntax` with the location of the first error.
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, CompileError> {
    let mut pairs = ScriptParser::parse(Rule::program, source).map_err(syntax_error)?;
    let program = pairs.next().ok_or(CompileError::Shape("expected program"))?;
    program
        .into_inner()
        .filter(|p| p.as_rule() != Rule::EOI)
        .map(parse_stmt)
        .collect()
}

fn syntax_error(err: pest::error::Error<Rule>) -> CompileError {
    let (line, column) = match err.line_col {
        LineColLocation::Pos(pos) => pos,
        LineColLocation::Span(start, _) => start,
    };
    CompileError::Syntax {
        line,
        column,
        message: err.variant.message().into_owned(),
    }
}

fn line_of(pair: &Pair<'_, Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

/// Inner pairs without keyword tokens
fn significant<'i>(pair: Pair<'i, Rule>) -> impl Iterator<Item = Pair<'i, Rule>> {
    pair.into_inner().filter(|p| {
        !matches!(
            p.as_rule(),
            Rule::kw_if
                | Rule::kw_else
                | Rule::kw_while
                | Rule::kw_for
                | Rule::kw_in
                | Rule::kw_break
                | Rule::kw_continue
                | Rule::kw_return
                | Rule::kw_let
        )
    })
}

fn next_pair<'i>(
    it: &mut impl Iterator<Item = Pair<'i, Rule>>,
    what: &'static str,
) -> Result<Pair<'i, Rule>, CompileError> {
    it.next().ok_or(CompileError::Shape(what))
}

fn parse_stmt(pair: Pair<'_, Rule>) -> Result<Stmt, CompileError> {
    let line = line_of(&pair);
    let kind = match pair.as_rule() {
        Rule::if_stmt => {
            let mut it = significant(pair);
            let cond = parse_expr(next_pair(&mut it, "if condition")?)?;
            let body = parse_block(next_pair(&mut it, "if body")?)?;
            let mut branches = vec![(cond, body)];
            let mut otherwise = None;
            for clause in it {
                match clause.as_rule() {
                    Rule::else_if_clause => {
                        let mut inner = significant(clause);
                        let cond = parse_expr(next_pair(&mut inner, "else if condition")?)?;
                        let body = parse_block(next_pair(&mut inner, "else if body")?)?;
                        branches.push((cond, body));
                    }
                    Rule::else_clause => {
                        let mut inner = significant(clause);
                        otherwise = Some(parse_block(next_pair(&mut inner, "else body")?)?);
                    }
                    _ => return Err(CompileError::Shape("unexpected if clause")),
                }
            }
            StmtKind::If {
                branches,
                otherwise,
            }
        }
        Rule::while_stmt => {
            let mut it = significant(pair);
            let cond = parse_expr(next_pair(&mut it, "while condition")?)?;
            let body = parse_block(next_pair(&mut it, "while body")?)?;
            StmtKind::While { cond, body }
        }
        Rule::for_stmt => {
            let mut it = significant(pair);
            let var = next_pair(&mut it, "for variable")?.as_str().to_string();
            let iter = parse_expr(next_pair(&mut it, "for iterable")?)?;
            let body = parse_block(next_pair(&mut it, "for body")?)?;
            StmtKind::For { var, iter, body }
        }
        Rule::break_stmt => StmtKind::Break,
        Rule::continue_stmt => StmtKind::Continue,
        Rule::return_stmt => {
            let value = significant(pair).next().map(parse_expr).transpose()?;
            StmtKind::Return(value)
        }
        Rule::assign_stmt => {
            let mut it = significant(pair);
            let place = parse_place(next_pair(&mut it, "assignment target")?)?;
            let op = match next_pair(&mut it, "assignment operator")?.as_str() {
                "=" => AssignOp::Set,
                "+=" => AssignOp::Add,
                "-=" => AssignOp::Sub,
                "*=" => AssignOp::Mul,
                "/=" => AssignOp::Div,
                _ => return Err(CompileError::Shape("unknown assignment operator")),
            };
            let value = parse_expr(next_pair(&mut it, "assigned value")?)?;
            StmtKind::Assign { place, op, value }
        }
        Rule::expr_stmt => {
            let mut it = pair.into_inner();
            StmtKind::Expr(parse_expr(next_pair(&mut it, "expression")?)?)
        }
        _ => return Err(CompileError::Shape("unexpected statement")),
    };
    Ok(Stmt { line, kind })
}

fn parse_block(pair: Pair<'_, Rule>) -> Result<Vec<Stmt>, CompileError> {
    pair.into_inner().map(parse_stmt).collect()
}

fn parse_place(pair: Pair<'_, Rule>) -> Result<Place, CompileError> {
    let mut it = pair.into_inner();
    let name = next_pair(&mut it, "place name")?.as_str().to_string();
    let accessors: Vec<_> = it.collect();
    let Some((last, rest)) = accessors.split_last() else {
        return Ok(Place::Var(name));
    };

    let mut base = Expr::Var(name);
    for accessor in rest {
        base = apply_postfix(base, accessor.clone())?;
    }
    let mut inner = last.clone().into_inner();
    match last.as_rule() {
        Rule::field_access => Ok(Place::Field(
            base,
            next_pair(&mut inner, "field name")?.as_str().to_string(),
        )),
        Rule::index_access => Ok(Place::Index(
            base,
            parse_expr(next_pair(&mut inner, "index")?)?,
        )),
        _ => Err(CompileError::Shape("unexpected accessor")),
    }
}

fn parse_expr(pair: Pair<'_, Rule>) -> Result<Expr, CompileError> {
    parse_expr_pairs(pair.into_inner())
}

fn parse_expr_pairs(pairs: Pairs<'_, Rule>) -> Result<Expr, CompileError> {
    pratt()
        .map_primary(parse_primary)
        .map_prefix(|op, rhs| {
            let rhs = Box::new(rhs?);
            match op.as_rule() {
                Rule::neg => Ok(Expr::Unary(UnaryOp::Neg, rhs)),
                Rule::bang | Rule::not_op => Ok(Expr::Unary(UnaryOp::Not, rhs)),
                _ => Err(CompileError::Shape("unknown prefix operator")),
            }
        })
        .map_postfix(|lhs, op| apply_postfix(lhs?, op))
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::or_op => BinaryOp::Or,
                Rule::and_op => BinaryOp::And,
                Rule::eq => BinaryOp::Eq,
                Rule::ne => BinaryOp::Ne,
                Rule::lt => BinaryOp::Lt,
                Rule::le => BinaryOp::Le,
                Rule::gt => BinaryOp::Gt,
                Rule::ge => BinaryOp::Ge,
                Rule::add => BinaryOp::Add,
                Rule::sub => BinaryOp::Sub,
                Rule::mul => BinaryOp::Mul,
                Rule::div => BinaryOp::Div,
                Rule::rem => BinaryOp::Rem,
                _ => return Err(CompileError::Shape("unknown infix operator")),
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

fn apply_postfix(lhs: Expr, op: Pair<'_, Rule>) -> Result<Expr, CompileError> {
    match op.as_rule() {
        Rule::call_args => {
            let args = op.into_inner().map(parse_expr).collect::<Result<_, _>>()?;
            Ok(Expr::Call {
                callee: Box::new(lhs),
                args,
            })
        }
        Rule::field_access => {
            let mut inner = op.into_inner();
            let name = next_pair(&mut inner, "field name")?.as_str().to_string();
            Ok(Expr::Field(Box::new(lhs), name))
        }
        Rule::index_access => {
            let mut inner = op.into_inner();
            let index = parse_expr(next_pair(&mut inner, "index")?)?;
            Ok(Expr::Index(Box::new(lhs), Box::new(index)))
        }
        _ => Err(CompileError::Shape("unknown postfix operator")),
    }
}

fn parse_primary(pair: Pair<'_, Rule>) -> Result<Expr, CompileError> {
    match pair.as_rule() {
        Rule::float => pair
            .as_str()
            .parse()
            .map(Expr::Float)
            .map_err(|_| literal_error(&pair, "invalid float literal")),
        Rule::int => pair
            .as_str()
            .parse()
            .map(Expr::Int)
            .map_err(|_| literal_error(&pair, "integer literal out of range")),
        Rule::string => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or(CompileError::Shape("string body"))?;
            Ok(Expr::Str(unescape(inner.as_str())))
        }
        Rule::boolean => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::nil => Ok(Expr::Nil),
        Rule::list => Ok(Expr::List(
            pair.into_inner().map(parse_expr).collect::<Result<_, _>>()?,
        )),
        Rule::ident => Ok(Expr::Var(pair.as_str().to_string())),
        Rule::expr => parse_expr(pair),
        _ => Err(CompileError::Shape("unexpected primary")),
    }
}

fn literal_error(pair: &Pair<'_, Rule>, message: &str) -> CompileError {
    let (line, column) = pair.as_span().start_pos().line_col();
    CompileError::Syntax {
        line,
        column,
        message: message.to_string(),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other @ ('\\' | '"' | '\'')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(source: &str) -> Expr {
        let program = parse_program(&format!("{};", source)).unwrap();
        match &program[0].kind {
            StmtKind::Expr(expr) => expr.clone(),
            other => panic!("expected expression, got {:?}", other),
        }
    }

    fn var(name: &str) -> Box<Expr> {
        Box::new(Expr::Var(name.to_string()))
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            single_expr("a + b * c"),
            Expr::Binary(
                BinaryOp::Add,
                var("a"),
                Box::new(Expr::Binary(BinaryOp::Mul, var("b"), var("c")))
            )
        );
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        assert_eq!(
            single_expr("not a == b"),
            Expr::Unary(
                UnaryOp::Not,
                Box::new(Expr::Binary(BinaryOp::Eq, var("a"), var("b")))
            )
        );
        assert_eq!(
            single_expr("!a == b"),
            Expr::Binary(
                BinaryOp::Eq,
                Box::new(Expr::Unary(UnaryOp::Not, var("a"))),
                var("b")
            )
        );
    }

    #[test]
    fn test_method_call_chain() {
        assert_eq!(
            single_expr("packet.split(\" \")[0]"),
            Expr::Index(
                Box::new(Expr::Call {
                    callee: Box::new(Expr::Field(var("packet"), "split".to_string())),
                    args: vec![Expr::Str(" ".to_string())],
                }),
                Box::new(Expr::Int(0))
            )
        );
    }

    #[test]
    fn test_keyword_prefixed_identifiers() {
        let program = parse_program("iffy = 1; notify(2); order = android or nothing;").unwrap();
        assert_eq!(program.len(), 3);
        assert!(matches!(
            &program[1].kind,
            StmtKind::Expr(Expr::Call { callee, .. }) if **callee == Expr::Var("notify".to_string())
        ));
        assert!(matches!(
            &program[2].kind,
            StmtKind::Assign { value: Expr::Binary(BinaryOp::Or, _, _), .. }
        ));
    }

    #[test]
    fn test_if_else_chain() {
        let program = parse_program(
            "if hp < 10 { heal(); } else if hp < 50 { rest(); } else { fight(); }",
        )
        .unwrap();
        match &program[0].kind {
            StmtKind::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_compound_assignment_to_field() {
        let program = parse_program("group.kills += 1;").unwrap();
        assert_eq!(
            program[0].kind,
            StmtKind::Assign {
                place: Place::Field(Expr::Var("group".to_string()), "kills".to_string()),
                op: AssignOp::Add,
                value: Expr::Int(1),
            }
        );
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        let program = parse_program("a == 1;").unwrap();
        assert!(matches!(program[0].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn test_comments_and_lines() {
        let program = parse_program("# first\nx = 1;\n// second\n\ny = 'it\\'s';").unwrap();
        assert_eq!(program[0].line, 2);
        assert_eq!(program[1].line, 5);
        assert_eq!(
            program[1].kind,
            StmtKind::Assign {
                place: Place::Var("y".to_string()),
                op: AssignOp::Set,
                value: Expr::Str("it's".to_string()),
            }
        );
    }

    #[test]
    fn test_syntax_error_location() {
        let err = parse_program("x = 1;\ny = ;").unwrap_err();
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_missing_semicolon() {
        assert!(parse_program("x = 1").is_err());
    }

    #[test]
    fn test_list_and_for() {
        let program = parse_program("for p in [1, 2, 3,] { total += p; }").unwrap();
        match &program[0].kind {
            StmtKind::For { var, iter, body } => {
                assert_eq!(var, "p");
                assert_eq!(
                    *iter,
                    Expr::List(vec![Expr::Int(1), Expr::Int(2), Expr::Int(3)])
                );
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_integer_overflow_is_a_syntax_error() {
        assert!(matches!(
            parse_program("x = 99999999999999999999;"),
            Err(CompileError::Syntax { .. })
        ));
    }
}
