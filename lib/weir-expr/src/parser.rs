use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while_m_n},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace1, one_of, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value, verify},
    error::{Error, ErrorKind},
    multi::{many0, many0_count, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};
use serde_json::Value as Json;

use crate::{
    ast::{BinaryOp, Expr, PathSeg},
    CompileError,
};

// Grammar keywords that can never be call targets. `not` stays callable, as it
// is an ordinary zero-argument filter.
const RESERVED: &[&str] = &["if", "then", "elif", "else", "end", "and", "or"];

/// Parses a full program, requiring all input to be consumed.
pub(crate) fn parse(source: &str) -> Result<Expr, CompileError> {
    match all_consuming(terminated(pipe_expr, sp)).parse(source) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(CompileError::Syntax {
            fragment: e.input.chars().take(24).collect(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(CompileError::Syntax {
            fragment: String::new(),
        }),
    }
}

/// Whitespace and `#` line comments.
fn sp(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0_count(alt((
            value((), multispace1),
            value((), pair(char('#'), take_while(|c| c != '\n'))),
        ))),
    )
    .parse(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))
    .parse(input)
}

/// Matches a bare keyword, refusing to match a longer identifier it prefixes.
fn kw<'a>(k: &'static str) -> impl Parser<&'a str, Output = &'a str, Error = Error<&'a str>> {
    terminated(tag(k), not(satisfy(is_ident_char)))
}

fn string_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut out = String::new();
    loop {
        match rest.chars().next() {
            None => return Err(nom::Err::Failure(Error::new(rest, ErrorKind::Char))),
            Some('"') => return Ok((&rest[1..], out)),
            Some('\\') => {
                let after = &rest[1..];
                let (next, c) = escape_char(after)?;
                out.push(c);
                rest = next;
            }
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

fn escape_char(input: &str) -> IResult<&str, char> {
    alt((
        value('"', char('"')),
        value('\\', char('\\')),
        value('/', char('/')),
        value('\n', char('n')),
        value('\t', char('t')),
        value('\r', char('r')),
        value('\u{0008}', char('b')),
        value('\u{000C}', char('f')),
        preceded(
            char('u'),
            map_res(
                take_while_m_n(4, 4, |c: char| c.is_ascii_hexdigit()),
                |hex: &str| {
                    let code = u32::from_str_radix(hex, 16).map_err(|_| ())?;
                    char::from_u32(code).ok_or(())
                },
            ),
        ),
    ))
    .parse(input)
}

fn number(input: &str) -> IResult<&str, Json> {
    let (rest, text) = recognize((
        digit1,
        opt(pair(char('.'), digit1)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)?;

    let parsed = if text.contains(['.', 'e', 'E']) {
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number)
    } else {
        text.parse::<i64>()
            .ok()
            .map(|n| Json::Number(n.into()))
            .or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Json::Number)
            })
    };

    match parsed {
        Some(v) => Ok((rest, v)),
        None => Err(nom::Err::Error(Error::new(input, ErrorKind::Digit))),
    }
}

fn integer(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i64>()).parse(input)
}

fn bracket_seg(input: &str) -> IResult<&str, PathSeg> {
    delimited(
        char('['),
        delimited(
            sp,
            alt((map(string_literal, PathSeg::Key), map(integer, PathSeg::Index))),
            sp,
        ),
        char(']'),
    )
    .parse(input)
}

fn path_suffix(input: &str) -> IResult<&str, PathSeg> {
    alt((
        preceded(char('.'), map(identifier, |s| PathSeg::Field(s.to_string()))),
        bracket_seg,
    ))
    .parse(input)
}

/// `.`, `.foo`, `.foo.bar[0]["key"]`, `.["key"]`, ...
fn dot_path(input: &str) -> IResult<&str, Expr> {
    let (rest, _) = char('.').parse(input)?;
    let (rest, first) = opt(alt((
        map(identifier, |s| PathSeg::Field(s.to_string())),
        bracket_seg,
    )))
    .parse(rest)?;

    let mut segs = Vec::new();
    let rest = match first {
        Some(seg) => {
            segs.push(seg);
            let (rest, more) = many0(path_suffix).parse(rest)?;
            segs.extend(more);
            rest
        }
        None => rest,
    };

    Ok((rest, Expr::Path { target: None, segs }))
}

fn array_expr(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(preceded(sp, char(',')), pipe_expr),
            preceded(sp, cut(char(']'))),
        ),
        Expr::Array,
    )
    .parse(input)
}

fn object_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, _) = char('{').parse(input)?;
    let (rest, entries) = separated_list0(
        preceded(sp, char(',')),
        pair(
            preceded(sp, alt((map(identifier, String::from), string_literal))),
            preceded(preceded(sp, cut(char(':'))), object_value),
        ),
    )
    .parse(rest)?;
    let (rest, _) = preceded(sp, cut(char('}'))).parse(rest)?;
    Ok((rest, Expr::Object(entries)))
}

// Object values stop short of `|`, exactly so `,` can separate entries;
// parenthesize to pipe inside a value.
fn object_value(input: &str) -> IResult<&str, Expr> {
    alternative_expr(input)
}

fn paren_expr(input: &str) -> IResult<&str, Expr> {
    delimited(char('('), pipe_expr, preceded(sp, cut(char(')')))).parse(input)
}

fn call_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = verify(identifier, |name: &&str| !RESERVED.contains(name)).parse(input)?;
    let (rest, args) = opt(delimited(
        preceded(sp, char('(')),
        separated_list0(preceded(sp, char(';')), pipe_expr),
        preceded(sp, cut(char(')'))),
    ))
    .parse(rest)?;

    Ok((
        rest,
        Expr::Call {
            name: name.to_string(),
            args: args.unwrap_or_default(),
        },
    ))
}

fn if_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, _) = kw("if").parse(input)?;
    let (rest, cond) = cut(pipe_expr).parse(rest)?;
    let (rest, _) = cut(preceded(sp, kw("then"))).parse(rest)?;
    let (rest, then_branch) = cut(pipe_expr).parse(rest)?;

    let mut clauses = vec![(cond, then_branch)];
    let (rest, more) = many0((
        preceded(sp, kw("elif")),
        cut(pipe_expr),
        cut(preceded(sp, kw("then"))),
        cut(pipe_expr),
    ))
    .parse(rest)?;
    for (_, cond, _, branch) in more {
        clauses.push((cond, branch));
    }

    let (rest, otherwise) = opt(preceded(preceded(sp, kw("else")), cut(pipe_expr))).parse(rest)?;
    let (rest, _) = cut(preceded(sp, kw("end"))).parse(rest)?;

    Ok((
        rest,
        Expr::If {
            clauses,
            otherwise: otherwise.map(Box::new),
        },
    ))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    preceded(
        sp,
        alt((
            if_expr,
            map(number, Expr::Literal),
            map(string_literal, |s| Expr::Literal(Json::String(s))),
            value(Expr::Literal(Json::Bool(true)), kw("true")),
            value(Expr::Literal(Json::Bool(false)), kw("false")),
            value(Expr::Literal(Json::Null), kw("null")),
            dot_path,
            array_expr,
            object_expr,
            paren_expr,
            call_expr,
        )),
    )
    .parse(input)
}

// Suffixes bind tightly: no whitespace between an expression and its path.
fn postfix_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, base) = primary(input)?;
    let (rest, segs) = many0(path_suffix).parse(rest)?;
    if segs.is_empty() {
        Ok((rest, base))
    } else {
        Ok((
            rest,
            Expr::Path {
                target: Some(Box::new(base)),
                segs,
            },
        ))
    }
}

fn unary_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(preceded(sp, char('-')), unary_expr), |e| {
            Expr::Neg(Box::new(e))
        }),
        postfix_expr,
    ))
    .parse(input)
}

fn multiplicative_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = unary_expr(input)?;
    let (rest, ops) = many0((
        preceded(
            sp,
            alt((
                value(BinaryOp::Mul, char('*')),
                // A lone slash; `//` is the fallback operator.
                value(BinaryOp::Div, terminated(char('/'), not(char('/')))),
                value(BinaryOp::Mod, char('%')),
            )),
        ),
        unary_expr,
    ))
    .parse(rest)?;
    Ok((rest, fold_binary(first, ops)))
}

fn additive_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = multiplicative_expr(input)?;
    let (rest, ops) = many0((
        preceded(
            sp,
            alt((
                value(BinaryOp::Add, char('+')),
                value(BinaryOp::Sub, char('-')),
            )),
        ),
        multiplicative_expr,
    ))
    .parse(rest)?;
    Ok((rest, fold_binary(first, ops)))
}

fn comparison_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, lhs) = additive_expr(input)?;
    let (rest, tail) = opt(pair(
        preceded(
            sp,
            alt((
                value(BinaryOp::Eq, tag("==")),
                value(BinaryOp::Ne, tag("!=")),
                value(BinaryOp::Le, tag("<=")),
                value(BinaryOp::Ge, tag(">=")),
                value(BinaryOp::Lt, char('<')),
                value(BinaryOp::Gt, char('>')),
            )),
        ),
        additive_expr,
    ))
    .parse(rest)?;

    match tail {
        Some((op, rhs)) => Ok((rest, fold_binary(lhs, vec![(op, rhs)]))),
        None => Ok((rest, lhs)),
    }
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = comparison_expr(input)?;
    let (rest, more) = many0(preceded(preceded(sp, kw("and")), comparison_expr)).parse(rest)?;
    Ok((rest, more.into_iter().fold(first, |acc, rhs| {
        Expr::And(Box::new(acc), Box::new(rhs))
    })))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = and_expr(input)?;
    let (rest, more) = many0(preceded(preceded(sp, kw("or")), and_expr)).parse(rest)?;
    Ok((rest, more.into_iter().fold(first, |acc, rhs| {
        Expr::Or(Box::new(acc), Box::new(rhs))
    })))
}

fn alternative_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = or_expr(input)?;
    let (rest, more) = many0(preceded(preceded(sp, tag("//")), or_expr)).parse(rest)?;
    Ok((rest, more.into_iter().fold(first, |acc, rhs| {
        Expr::Alternative(Box::new(acc), Box::new(rhs))
    })))
}

fn pipe_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, first) = alternative_expr(input)?;
    let (rest, more) = many0(preceded(preceded(sp, char('|')), alternative_expr)).parse(rest)?;
    Ok((rest, more.into_iter().fold(first, |acc, rhs| {
        Expr::Pipe(Box::new(acc), Box::new(rhs))
    })))
}

fn fold_binary(first: Expr, ops: Vec<(BinaryOp, Expr)>) -> Expr {
    ops.into_iter().fold(first, |acc, (op, rhs)| Expr::Binary {
        op,
        lhs: Box::new(acc),
        rhs: Box::new(rhs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Expr {
        match parse(source) {
            Ok(expr) => expr,
            Err(e) => panic!("expected '{}' to parse, got: {}", source, e),
        }
    }

    fn parse_err(source: &str) -> CompileError {
        match parse(source) {
            Ok(_) => panic!("expected '{}' to fail", source),
            Err(e) => e,
        }
    }

    #[test]
    fn identity_and_paths() {
        assert!(matches!(parse_ok("."), Expr::Path { target: None, ref segs } if segs.is_empty()));

        match parse_ok(r#".a.b[0]["odd key"]"#) {
            Expr::Path { target: None, segs } => {
                assert_eq!(
                    segs,
                    vec![
                        PathSeg::Field("a".into()),
                        PathSeg::Field("b".into()),
                        PathSeg::Index(0),
                        PathSeg::Key("odd key".into()),
                    ]
                );
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn keywords_are_not_identifiers() {
        // `iffy` is an ordinary call even though it starts with `if`.
        assert!(matches!(parse_ok("iffy"), Expr::Call { ref name, .. } if name == "iffy"));
        parse_err("then");
    }

    #[test]
    fn precedence_pipe_is_loosest() {
        match parse_ok(".a // .b | .c") {
            Expr::Pipe(lhs, _) => assert!(matches!(*lhs, Expr::Alternative(..))),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn slash_slash_is_not_division() {
        assert!(matches!(parse_ok(".a // 1"), Expr::Alternative(..)));
        assert!(matches!(
            parse_ok(".a / 2"),
            Expr::Binary { op: BinaryOp::Div, .. }
        ));
    }

    #[test]
    fn call_arguments_are_semicolon_separated() {
        match parse_ok(r#"event("ns"; .time; {count: 1})"#) {
            Expr::Call { name, args } => {
                assert_eq!(name, "event");
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn if_requires_end() {
        parse_ok("if .a then 1 elif .b then 2 else 3 end");
        parse_ok("if .a then 1 end");
        parse_err("if .a then 1");
    }

    #[test]
    fn comments_are_whitespace() {
        parse_ok("# leading comment\n.a # trailing\n| .b");
    }

    #[test]
    fn string_escapes() {
        match parse_ok(r#""a\"b\nA""#) {
            Expr::Literal(Json::String(s)) => assert_eq!(s, "a\"b\nA"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn number_shapes() {
        assert!(matches!(parse_ok("12"), Expr::Literal(Json::Number(ref n)) if n.is_i64()));
        assert!(matches!(parse_ok("12.5"), Expr::Literal(Json::Number(ref n)) if n.is_f64()));
        assert!(matches!(parse_ok("-4"), Expr::Neg(_)));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        parse_err(".a .b");
        parse_err(".a ??");
    }
}
