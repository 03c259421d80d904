//! `nom` parsers for hand-written header values.
//!
//! These cover the value grammars applications type into configuration and
//! factory calls (URIs, name-addrs, Via, tokens with parameters, media
//! types). Message framing is not handled here.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_till, take_while, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{all_consuming, map, map_res, opt},
    multi::many0,
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};

use crate::headers::{MimeType, Token, Via};
use crate::name_addr::NameAddr;
use crate::param::{Param, Params};
use crate::uri::{Scheme, Uri};

/// Type alias for parser results
pub type ParseResult<'a, O> = IResult<&'a str, O>;

/// token characters (RFC 3261 §25.1)
pub fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._+~!*'%".contains(c)
}

fn is_param_value_char(c: char) -> bool {
    !c.is_whitespace() && !";,<>?\"".contains(c)
}

/// Run a parser over the whole input, returning `None` on any leftover
pub fn parse_complete<'a, O, F>(parser: F, input: &'a str) -> Option<O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    all_consuming(parser)(input).ok().map(|(_, value)| value)
}

pub fn token(input: &str) -> ParseResult<&str> {
    take_while1(is_token_char)(input)
}

fn quoted_string(input: &str) -> ParseResult<String> {
    map(delimited(char('"'), take_till(|c: char| c == '"'), char('"')), str::to_string)(input)
}

fn param_value(input: &str) -> ParseResult<String> {
    alt((quoted_string, map(take_while1(is_param_value_char), str::to_string)))(input)
}

/// `;name[=value]`
pub fn param(input: &str) -> ParseResult<Param> {
    let (input, _) = tuple((space0, char(';'), space0))(input)?;
    let (input, name) = token(input)?;
    let (input, value) = opt(preceded(tuple((space0, char('='), space0)), param_value))(input)?;
    Ok((
        input,
        Param {
            name: name.to_string(),
            value,
        },
    ))
}

pub fn params(input: &str) -> ParseResult<Params> {
    map(many0(param), Params::from)(input)
}

fn scheme(input: &str) -> ParseResult<Scheme> {
    map(
        terminated(
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
            char(':'),
        ),
        Scheme::from_token,
    )(input)
}

fn userinfo(input: &str) -> ParseResult<&str> {
    terminated(
        take_while1(|c: char| c != '@' && c != '>' && c != ',' && !c.is_whitespace()),
        char('@'),
    )(input)
}

fn host(input: &str) -> ParseResult<&str> {
    alt((
        nom::combinator::recognize(delimited(
            char('['),
            take_while1(|c: char| c != ']'),
            char(']'),
        )),
        take_while1(is_host_char),
    ))(input)
}

fn port(input: &str) -> ParseResult<u16> {
    preceded(char(':'), map_res(digit1, |d: &str| d.parse::<u16>()))(input)
}

fn uri_parts(input: &str, with_params: bool) -> ParseResult<Uri> {
    let (input, scheme) = scheme(input)?;
    let (input, user) = opt(userinfo)(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = if with_params {
        params(input)?
    } else {
        (input, Params::new())
    };
    let (input, _) = if with_params {
        opt(preceded(char('?'), take_while(|c: char| c != '>' && !c.is_whitespace())))(input)?
    } else {
        (input, None)
    };
    Ok((
        input,
        Uri {
            scheme,
            user: user.map(str::to_string),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

/// A URI with its URI parameters
pub fn uri(input: &str) -> ParseResult<Uri> {
    uri_parts(input, true)
}

fn display_name(input: &str) -> ParseResult<Option<String>> {
    alt((
        map(terminated(quoted_string, space0), Some),
        map(take_while(|c: char| c != '<' && c != '"'), |s: &str| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }),
    ))(input)
}

fn angle_name_addr(input: &str) -> ParseResult<NameAddr> {
    let (input, display_name) = display_name(input)?;
    let (input, uri) = delimited(char('<'), uri, char('>'))(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        NameAddr {
            display_name,
            uri,
            params,
        },
    ))
}

fn bare_name_addr(input: &str) -> ParseResult<NameAddr> {
    let (input, uri) = uri_parts(input, false)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: None,
            uri,
            params,
        },
    ))
}

/// name-addr or addr-spec; parameters after a bare addr-spec are header parameters
pub fn name_addr(input: &str) -> ParseResult<NameAddr> {
    let (input, _) = space0(input)?;
    alt((angle_name_addr, bare_name_addr))(input)
}

/// `SIP/2.0/UDP host[:port];params`
pub fn via(input: &str) -> ParseResult<Via> {
    let (input, _) = tuple((
        tag_no_case("SIP"),
        space0,
        char('/'),
        space0,
        tag("2.0"),
        space0,
        char('/'),
        space0,
    ))(input)?;
    let (input, transport) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

/// `value;param=...`
pub fn token_with_params(input: &str) -> ParseResult<Token> {
    let (input, value) = token(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        Token {
            value: value.to_string(),
            params,
        },
    ))
}

/// `type/subtype;params`
pub fn mime_type(input: &str) -> ParseResult<MimeType> {
    let (input, media_type) = token(input)?;
    let (input, _) = tuple((space0, char('/'), space0))(input)?;
    let (input, subtype) = token(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        MimeType {
            media_type: media_type.to_string(),
            subtype: subtype.to_string(),
            params,
        },
    ))
}

/// `SIP/2.0 <code> <reason>` status line, used for sipfrag bodies
pub fn status_line(input: &str) -> ParseResult<u16> {
    let (input, _) = tuple((space0, tag_no_case("SIP/2.0"), space1))(input)?;
    let (input, code) = map_res(digit1, |d: &str| d.parse::<u16>())(input)?;
    let (input, _) = take_while(|c: char| c != '\r' && c != '\n')(input)?;
    Ok((input, code))
}
