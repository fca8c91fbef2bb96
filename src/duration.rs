// Logmet -- extract metrics from log streams
// Copyright (C) 2025  The logmet authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::digit1,
    combinator::all_consuming,
    multi::many1,
    sequence::pair,
};
use std::result;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error")]
    SyntaxError,
    #[error("value error")]
    ValueError,
}

/// One component of a duration: an integer followed by a unit.
fn parse_component(input: &str) -> IResult<&str, Duration> {
    let (input, (value, unit)) = pair(
        digit1,
        alt((tag("ms"), tag("s"), tag("m"), tag("h"), tag("d"))),
    )
    .parse(input)?;
    let value = value.parse::<u64>().unwrap_or(u64::MAX);
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 86400),
        _ => panic!("internal error: arm should be unreachable"),
    };
    Ok((input, duration))
}

/// Components in any order, summed. A trailing bare integer counts as seconds.
fn parse_duration_partial(input: &str) -> IResult<&str, Duration> {
    let (input, components) = many1(parse_component).parse(input)?;
    Ok((input, components.iter().sum()))
}

/// Parse a duration such as `250ms`, `90s`, `1h30m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> result::Result<Duration, ParseError> {
    match all_consuming(parse_duration_partial).parse(input) {
        Ok((_, duration)) => Ok(duration),
        Err(_) => {
            // Bare integers are seconds.
            let (_, digits) = all_consuming(digit1)
                .parse(input)
                .map_err(|_: nom::Err<nom::error::Error<&str>>| ParseError::SyntaxError)?;
            let value = digits.parse::<u64>().map_err(|_| ParseError::ValueError)?;
            Ok(Duration::from_secs(value))
        }
    }
}

/// Scan a duration at the start of the input, returning it with the number of
/// bytes consumed. Used by the program lexer for duration literals.
pub fn scan_duration(input: &str) -> result::Result<(Duration, usize), ParseError> {
    match parse_duration_partial(input) {
        Ok((rest, duration)) => Ok((duration, input.len() - rest.len())),
        Err(_) => Err(ParseError::SyntaxError),
    }
}
