#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the bench console.
//!
//! The lexer uses `regal` to produce a bounded token stream, and the parser
//! composes `winnow` combinators over those tokens. Keywords match
//! case-insensitively; numbers may carry a sign and a fractional part.

use core::fmt;
use core::ops::Range;
use core::time::Duration;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

/// Maximum number of tokens produced per console line.
pub const MAX_TOKENS: usize = 32;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds recognized by the console grammar.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Duration literal ending in `ms` or `s`.
    #[regex(r"[0-9]+(?:ms|s)", priority = 2)]
    Duration,
    /// Decimal literal with optional sign and fraction.
    #[regex(r"-?[0-9]+(?:\.[0-9]+)?")]
    Number,
    /// Identifier or keyword (case-insensitive match performed later).
    #[regex(r"[A-Za-z][A-Za-z0-9-]*")]
    Ident,
    #[token("=")]
    Equals,
    /// Inline whitespace is ignored.
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    /// Pseudo variant used when the lexer encounters unsupported input.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token emitted by the lexer with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens { processed: usize },
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: Option<TokenKind>,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidNumber {
        span: Range<usize>,
    },
    InvalidDuration {
        span: Range<usize>,
    },
    /// A number parsed but lies outside the range the command accepts.
    OutOfRange {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
}

impl fmt::Display for GrammarErrorKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found {found:?} at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::InvalidNumber { span } => {
                write!(f, "invalid number at {span:?}")
            }
            GrammarErrorKind::InvalidDuration { span } => {
                write!(f, "invalid duration literal at {span:?}")
            }
            GrammarErrorKind::OutOfRange { span } => {
                write!(f, "value out of range at {span:?}")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl fmt::Display for GrammarError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    found: Some(tok.kind),
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn with_span(token: &Token<'a>, make: fn(Range<usize>) -> GrammarErrorKind<'a>) -> Self {
        GrammarError {
            kind: make(token.span.clone()),
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];
type PResult<'src, T> = Result<T, ErrMode<GrammarError<'src>>>;

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

/// Combined lex/parse error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl fmt::Display for ParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Structured commands produced by the parser.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    /// Seat or remove the connector.
    Plug(bool),
    Pilot(PilotCommand),
    Bms(BmsCommand),
    Stage(StageCommand),
    /// Run this many poll iterations.
    Step(u32),
    /// Let simulated time pass, polling as it goes.
    Advance(Duration),
    Status,
    History,
    Help(HelpCommand<'a>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PilotCommand {
    pub duty_percent: f32,
    pub frequency_hz: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BmsCommand {
    Ready(bool),
    Kill(bool),
    Pack { volts: f32, amps: f32 },
    Cells { millivolts: f32, celsius: f32 },
    Capacity { watt_hours: f32 },
    Silent,
    Resume,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StageCommand {
    Online(bool),
    Temperature(f32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelpCommand<'a> {
    pub topic: Option<&'a str>,
}

/// Tokenize the provided line.
///
/// # Errors
///
/// Fails when the line holds more tokens than [`MAX_TOKENS`] or the lexer
/// engine gives up.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }

        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        if buffer
            .push(Token {
                kind: record.token,
                lexeme,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let span = start..start + partial.fragment.len();
        if buffer
            .push(Token {
                kind: TokenKind::Error,
                lexeme: partial.fragment,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parse a console command from the provided line.
///
/// # Errors
///
/// Returns the lexer or grammar error describing the first problem found.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    if let Some(token) = tokens.iter().find(|token| token.kind == TokenKind::Error) {
        return Err(ParseError::Grammar(GrammarError::invalid_token(token)));
    }

    let mut input = tokens.as_slice();
    let command = match command().parse_next(&mut input) {
        Ok(command) => command,
        Err(ErrMode::Backtrack(err) | ErrMode::Cut(err)) => {
            return Err(ParseError::Grammar(err));
        }
        Err(ErrMode::Incomplete(_)) => {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "token",
                input.first(),
            )));
        }
    };

    if let Some(token) = input.iter().find(|token| token.kind != TokenKind::Eol) {
        return Err(ParseError::Grammar(GrammarError::unexpected(
            "end of command",
            Some(token),
        )));
    }

    Ok(command)
}

fn command<'src, 'slice>() -> impl Parser<Input<'src, 'slice>, Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let keyword = expect_kind(TokenKind::Ident, "command keyword").parse_next(input)?;
        match canonical(keyword.lexeme) {
            Some("plug") => parse_plug(input),
            Some("pilot") => parse_pilot(input),
            Some("bms") => parse_bms(input),
            Some("stage") => parse_stage(input),
            Some("step") => parse_step(input),
            Some("advance") => {
                let token = expect_kind(TokenKind::Duration, "duration").parse_next(input)?;
                Ok(Command::Advance(parse_duration(&token).map_err(ErrMode::Cut)?))
            }
            Some("status") => Ok(Command::Status),
            Some("history") => Ok(Command::History),
            Some("help") => Ok(Command::Help(HelpCommand {
                topic: optional_ident(input),
            })),
            _ => Err(ErrMode::Backtrack(GrammarError::unexpected(
                "command keyword",
                Some(&keyword),
            ))),
        }
    }
}

fn parse_plug<'src>(input: &mut Input<'src, '_>) -> PResult<'src, Command<'src>> {
    let token = expect_kind(TokenKind::Ident, "in").parse_next(input)?;
    if token.lexeme.eq_ignore_ascii_case("in") {
        Ok(Command::Plug(true))
    } else if token.lexeme.eq_ignore_ascii_case("out") {
        Ok(Command::Plug(false))
    } else {
        Err(ErrMode::Backtrack(GrammarError::unexpected("in", Some(&token))))
    }
}

fn parse_pilot<'src>(input: &mut Input<'src, '_>) -> PResult<'src, Command<'src>> {
    let (duty_token, duty_percent) = assignment(input, "duty")?;
    if !(0.0..=100.0).contains(&duty_percent) {
        return Err(ErrMode::Cut(GrammarError::with_span(&duty_token, |span| {
            GrammarErrorKind::OutOfRange { span }
        })));
    }
    let (_, frequency_hz) = assignment(input, "freq")?;
    Ok(Command::Pilot(PilotCommand {
        duty_percent,
        frequency_hz,
    }))
}

fn parse_bms<'src>(input: &mut Input<'src, '_>) -> PResult<'src, Command<'src>> {
    let token = expect_kind(TokenKind::Ident, "ready").parse_next(input)?;
    let command = match canonical(token.lexeme) {
        Some("ready") => BmsCommand::Ready(on_off(input)?),
        Some("kill") => BmsCommand::Kill(on_off(input)?),
        Some("pack") => {
            let (_, volts) = assignment(input, "volts")?;
            let (_, amps) = assignment(input, "amps")?;
            BmsCommand::Pack { volts, amps }
        }
        Some("cells") => {
            let (_, millivolts) = assignment(input, "mv")?;
            let (_, celsius) = assignment(input, "temp")?;
            BmsCommand::Cells {
                millivolts,
                celsius,
            }
        }
        Some("capacity") => {
            let (_, watt_hours) = assignment(input, "wh")?;
            BmsCommand::Capacity { watt_hours }
        }
        Some("silent") => BmsCommand::Silent,
        Some("resume") => BmsCommand::Resume,
        _ => {
            return Err(ErrMode::Backtrack(GrammarError::unexpected(
                "ready",
                Some(&token),
            )));
        }
    };
    Ok(Command::Bms(command))
}

fn parse_stage<'src>(input: &mut Input<'src, '_>) -> PResult<'src, Command<'src>> {
    let token = expect_kind(TokenKind::Ident, "online").parse_next(input)?;
    let command = match canonical(token.lexeme) {
        Some("online") => StageCommand::Online(true),
        Some("offline") => StageCommand::Online(false),
        Some("temp") => {
            let _ = expect_kind(TokenKind::Equals, "=").parse_next(input)?;
            StageCommand::Temperature(number(input)?.1)
        }
        _ => {
            return Err(ErrMode::Backtrack(GrammarError::unexpected(
                "online",
                Some(&token),
            )));
        }
    };
    Ok(Command::Stage(command))
}

fn parse_step<'src>(input: &mut Input<'src, '_>) -> PResult<'src, Command<'src>> {
    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Number => {
            let count = token
                .lexeme
                .parse::<u32>()
                .map_err(|_| ErrMode::Cut(GrammarError::with_span(token, invalid_number)))?;
            *input = rest;
            Ok(Command::Step(count))
        }
        _ => Ok(Command::Step(1)),
    }
}

/// `key=value` where `key` matches case-insensitively.
fn assignment<'src>(
    input: &mut Input<'src, '_>,
    key: &'static str,
) -> PResult<'src, (Token<'src>, f32)> {
    let name = expect_kind(TokenKind::Ident, key).parse_next(input)?;
    if !name.lexeme.eq_ignore_ascii_case(key) {
        return Err(ErrMode::Backtrack(GrammarError::unexpected(key, Some(&name))));
    }
    let _ = expect_kind(TokenKind::Equals, "=").parse_next(input)?;
    number(input)
}

fn number<'src>(input: &mut Input<'src, '_>) -> PResult<'src, (Token<'src>, f32)> {
    let token = expect_kind(TokenKind::Number, "number").parse_next(input)?;
    let value = token
        .lexeme
        .parse::<f32>()
        .map_err(|_| ErrMode::Cut(GrammarError::with_span(&token, invalid_number)))?;
    Ok((token, value))
}

fn on_off<'src>(input: &mut Input<'src, '_>) -> PResult<'src, bool> {
    let token = expect_kind(TokenKind::Ident, "on").parse_next(input)?;
    if token.lexeme.eq_ignore_ascii_case("on") {
        Ok(true)
    } else if token.lexeme.eq_ignore_ascii_case("off") {
        Ok(false)
    } else {
        Err(ErrMode::Backtrack(GrammarError::unexpected("on", Some(&token))))
    }
}

fn optional_ident<'src>(input: &mut Input<'src, '_>) -> Option<&'src str> {
    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Ident => {
            *input = rest;
            Some(token.lexeme)
        }
        _ => None,
    }
}

fn invalid_number<'a>(span: Range<usize>) -> GrammarErrorKind<'a> {
    GrammarErrorKind::InvalidNumber { span }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}

fn parse_duration<'a>(token: &Token<'a>) -> Result<Duration, GrammarError<'a>> {
    let invalid = || GrammarError::with_span(token, |span| GrammarErrorKind::InvalidDuration { span });
    let text = token.lexeme;
    if let Some(rest) = text.strip_suffix("ms") {
        let millis = rest.parse::<u32>().map_err(|_| invalid())?;
        Ok(Duration::from_millis(millis.into()))
    } else if let Some(rest) = text.strip_suffix('s') {
        let seconds = rest.parse::<u32>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(seconds.into()))
    } else {
        Err(invalid())
    }
}

const KEYWORDS: &[&str] = &[
    "plug", "pilot", "bms", "stage", "step", "advance", "status", "history", "help", "ready",
    "kill", "pack", "cells", "capacity", "silent", "resume", "online", "offline", "temp",
];

/// Known keyword matching `lexeme` case-insensitively.
fn canonical(lexeme: &str) -> Option<&'static str> {
    KEYWORDS
        .iter()
        .copied()
        .find(|keyword| keyword.eq_ignore_ascii_case(lexeme))
}
