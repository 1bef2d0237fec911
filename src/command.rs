//! The AGI command catalogue and the [`Command`] result model.
//!
//! Every reply to an AGI command is a line `200 result=<payload>`. The payload
//! shapes are uniform enough that a single [`Command`] value object carries
//! all of them; the catalogue in [`result_patterns`] records, per command, the
//! result codes that mean success and failure and thereby drives the outcome
//! classification.
use crate::{AGIError, AGIParseError};

/// Success and failure result-line templates for every supported AGI command.
///
/// The first whitespace-delimited token of each template is the outcome code
/// for that command; `%s` marks a free slot. Returns `None` for names that are
/// not in the catalogue.
pub fn result_patterns(name: &str) -> Option<(&'static str, &'static str)> {
    let patterns = match name {
        "ANSWER" => ("0", "-1"),
        "CHANNEL STATUS" => ("%s", "-1"),
        "CONTROL STREAM FILE" => ("0 endpos=%s", "-1 endpos=%s"),
        "DATABASE DEL" => ("1", "0"),
        "DATABASE DELTREE" => ("1", "0"),
        "DATABASE GET" => ("1 (%s)", "0"),
        "DATABASE PUT" => ("1 (%s)", "0"),
        "EXEC" => ("%s", "-2"),
        "GET DATA" => ("%s %s", "-1"),
        "GET FULL VARIABLE" => ("1 %s", "0"),
        "GET OPTION" => ("0 endpos=%s", "-1 endpos=%s"),
        "GET VARIABLE" => ("1 (%s)", "0"),
        "HANGUP" => ("1", "-1"),
        "NOOP" => ("0", "0"),
        "RECEIVE CHAR" => ("%s %s", "-1 %s"),
        "RECEIVE TEXT" => ("%s", "-1"),
        "RECORD FILE" => ("%s %s endpos=%s", "-1 %s"),
        "SAY ALPHA" | "SAY DATE" | "SAY DATETIME" | "SAY DIGITS" | "SAY NUMBER"
        | "SAY PHONETIC" | "SAY TIME" => ("0", "-1"),
        "SEND IMAGE" | "SEND TEXT" => ("0", "-1"),
        "SET AUTOHANGUP" | "SET CONTEXT" | "SET EXTENSION" | "SET MUSIC" | "SET PRIORITY" => {
            ("0", "0")
        }
        "SET CALLERID" | "SET VARIABLE" => ("1", "1"),
        "STREAM FILE" => ("0 endpos=%s", "-1 endpos=%s"),
        "TDD MODE" => ("1", "-1"),
        "VERBOSE" => ("1", "1"),
        "WAIT FOR DIGIT" => ("0", "-1"),
        _ => return None,
    };
    Some(patterns)
}

/// The first whitespace-delimited token of a catalogue template.
fn outcome_code(pattern: &'static str) -> &'static str {
    pattern.split_whitespace().next().unwrap_or(pattern)
}

/// The parsed outcome of one AGI command.
///
/// `result` is kept as text: some commands legitimately return character codes
/// that are only later decoded (see [`convert_dtmf`](Self::convert_dtmf)).
#[derive(Debug, Clone)]
pub struct Command {
    /// Canonical uppercase command name, e.g. `STREAM FILE`.
    pub name: String,
    /// First token following `result=`.
    pub result: String,
    /// Optional second token, parenthesised on the wire if present
    /// (e.g. `(timeout)`, `(dtmf)`, `(hangup)`).
    pub extra: Option<String>,
    /// Stream position at which a media operation stopped, in samples.
    pub endpos: Option<u64>,
    has_dtmf: bool,
}
impl Command {
    pub(crate) fn new(
        name: &str,
        result: String,
        extra: Option<String>,
        endpos: Option<u64>,
    ) -> Command {
        Command {
            name: name.to_ascii_uppercase(),
            result,
            extra,
            endpos,
            has_dtmf: false,
        }
    }

    fn code(&self, success: bool) -> Option<&'static str> {
        let (success_pattern, failure_pattern) = result_patterns(&self.name)?;
        Some(outcome_code(if success {
            success_pattern
        } else {
            failure_pattern
        }))
    }

    /// Whether the result equals this command's success code.
    pub fn is_success(&self) -> bool {
        self.code(true) == Some(self.result.as_str())
    }

    /// Whether the result equals this command's failure code.
    pub fn is_failure(&self) -> bool {
        self.code(false) == Some(self.result.as_str())
    }

    /// Whether the result is one of the two default codes for this command.
    pub fn is_default(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// Whether this result denotes an error. Commands whose success and
    /// failure codes coincide (`NOOP`, `VERBOSE`, ...) never report one.
    pub fn has_error(&self) -> bool {
        self.is_failure() && !self.is_success()
    }

    /// Whether [`convert_dtmf`](Self::convert_dtmf) has been applied.
    pub fn has_dtmf(&self) -> bool {
        self.has_dtmf
    }

    /// Reinterpret the result as a decimal ASCII code and replace it with the
    /// corresponding character. Must not be applied twice.
    pub fn convert_dtmf(&mut self) -> Result<(), AGIParseError> {
        let decoded = self
            .result
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| AGIParseError::DtmfUnparsable(self.result.clone()))?;
        self.result = decoded.to_string();
        self.has_dtmf = true;
        Ok(())
    }
}
/// Compares `(name, result, endpos)` only. `extra` is intentionally excluded:
/// asterisk omits it inconsistently.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.result == other.result && self.endpos == other.endpos
    }
}
impl Eq for Command {}
impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: result={}", self.name, self.result)?;
        if let Some(ref extra) = self.extra {
            write!(f, " ({extra})")?;
        }
        if let Some(endpos) = self.endpos {
            write!(f, " endpos={endpos}")?;
        }
        Ok(())
    }
}

/// Split the payload following `200 result=` into its
/// `(result, extra, endpos)` parts.
fn split_payload(payload: &str) -> (String, Option<String>, Option<u64>) {
    let mut rest = payload.trim();
    let mut endpos = None;
    if let Some(index) = rest.to_ascii_lowercase().rfind("endpos=") {
        let digits = &rest[index + 7..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            endpos = digits.parse::<u64>().ok();
            rest = rest[..index].trim_end();
        }
    }
    let mut tokens = rest.splitn(2, char::is_whitespace);
    let result = tokens.next().unwrap_or("").to_owned();
    let extra = tokens
        .next()
        .map(|t| t.trim_matches(|c: char| c == ' ' || c == ',' || c == '(' || c == ')'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_owned());
    (result, extra, endpos)
}

/// Parse the payload of a `200 result=` reply to the named command.
///
/// If the catalogue classifies the result as the failure code for this
/// command, the parsed [`Command`] is surfaced inside
/// [`AGIError::CommandFailure`].
pub(crate) fn parse_result(name: &str, payload: &str) -> Result<Command, AGIError> {
    let (result, extra, endpos) = split_payload(payload);
    let command = Command::new(name, result, extra, endpos);
    if command.has_error() {
        return Err(AGIError::CommandFailure {
            code: 200,
            message: payload.to_owned(),
            command: Some(command),
        });
    }
    Ok(command)
}

/// Channel states reported by `CHANNEL STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// 0 - Channel is down and available.
    Available,
    /// 1 - Channel is down, but reserved.
    Reserved,
    /// 2 - Channel is off hook.
    OffHook,
    /// 3 - Digits (or equivalent) have been dialed.
    DigitsDialed,
    /// 4 - Line is ringing.
    LineRinging,
    /// 5 - Remote end is ringing.
    RemoteRinging,
    /// 6 - Line is up.
    Up,
    /// 7 - Line is busy.
    Busy,
}
impl ChannelStatus {
    /// Decode the result token of a successful `CHANNEL STATUS` command.
    pub fn from_result(result: &str) -> Option<ChannelStatus> {
        match result {
            "0" => Some(ChannelStatus::Available),
            "1" => Some(ChannelStatus::Reserved),
            "2" => Some(ChannelStatus::OffHook),
            "3" => Some(ChannelStatus::DigitsDialed),
            "4" => Some(ChannelStatus::LineRinging),
            "5" => Some(ChannelStatus::RemoteRinging),
            "6" => Some(ChannelStatus::Up),
            "7" => Some(ChannelStatus::Busy),
            _ => None,
        }
    }
}
