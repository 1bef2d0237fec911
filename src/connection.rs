//! The FastAGI side: per-call session state machine and the command API.
//!
//! Asterisk opens the TCP connection, dumps the environment of the call as
//! `key: value` lines ended by a blank line, and then waits for commands. Each
//! session is driven by one pump task which owns the transport and the FIFO of
//! in-flight commands; the [`Connection`] handle given to a
//! [`CallHandler`](crate::handler::CallHandler) talks to that pump. Replies
//! match commands in strict send order, so commands may be pipelined.
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::command::{parse_result, Command};
use crate::framer::LineFramer;
use crate::{AGIError, AGIParseError, AGIUrl};

/// Environment variables for one asterisk dial session.
///
/// Keys are stored lowercased, values verbatim with trailing whitespace
/// stripped. The variables usually present are:
///
/// - agi_network = 'yes'
/// - agi_request = 'agi://localhost'
/// - agi_channel = 'SIP/test-321555es'
/// - agi_language = 'en'
/// - agi_type = 'SIP'
/// - agi_uniqueid = '1139871605.0'
/// - agi_callerid = '70065798'
/// - agi_calleridname = 'Test Name'
/// - agi_context = 'testing'
/// - agi_extension = '1'
/// - agi_priority = '1'
/// - agi_accountcode = ''
/// - agi_dnid = '1'
/// - agi_rdnis = 'unknown'
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEnv {
    vars: HashMap<String, String>,
}
impl SessionEnv {
    pub(crate) fn new() -> SessionEnv {
        SessionEnv {
            vars: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_ascii_lowercase(), value.to_owned());
    }

    /// Look up a variable by its full (lowercase) name, e.g. `agi_channel`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The raw `agi_request` value.
    pub fn request(&self) -> Option<&str> {
        self.get("agi_request")
    }

    pub fn channel(&self) -> Option<&str> {
        self.get("agi_channel")
    }

    pub fn callerid(&self) -> Option<&str> {
        self.get("agi_callerid")
    }

    pub fn calleridname(&self) -> Option<&str> {
        self.get("agi_calleridname")
    }

    pub fn context(&self) -> Option<&str> {
        self.get("agi_context")
    }

    pub fn extension(&self) -> Option<&str> {
        self.get("agi_extension")
    }

    pub fn priority(&self) -> Option<&str> {
        self.get("agi_priority")
    }

    pub fn uniqueid(&self) -> Option<&str> {
        self.get("agi_uniqueid")
    }

    pub fn language(&self) -> Option<&str> {
        self.get("agi_language")
    }

    pub fn accountcode(&self) -> Option<&str> {
        self.get("agi_accountcode")
    }

    pub fn dnid(&self) -> Option<&str> {
        self.get("agi_dnid")
    }

    pub fn rdnis(&self) -> Option<&str> {
        self.get("agi_rdnis")
    }

    /// The channel technology, from `agi_type`.
    pub fn channel_type(&self) -> Option<&str> {
        self.get("agi_type")
    }
}

/// A command in flight, waiting for its reply line.
struct PendingRequest {
    name: String,
    reply: oneshot::Sender<Result<Command, AGIError>>,
}

pub(crate) enum SessionMessage {
    Command {
        line: String,
        name: String,
        reply: oneshot::Sender<Result<Command, AGIError>>,
    },
    Finish,
}

/// Read the environment block asterisk sends at the start of a session.
///
/// Returns the bindings plus any records that arrived after the terminating
/// blank line in the same read (possible when asterisk pipelines).
pub(crate) async fn read_environment<S>(
    stream: &mut S,
    framer: &mut LineFramer,
) -> Result<(SessionEnv, VecDeque<String>), AGIError>
where
    S: AsyncRead + Unpin,
{
    let mut env = SessionEnv::new();
    let mut buf = [0_u8; 2048];
    loop {
        let bytes_read = stream
            .read(&mut buf)
            .await
            .map_err(|_| AGIError::ConnectionTerminated)?;
        if bytes_read == 0 {
            return Err(AGIError::ConnectionTerminated);
        }
        let records = framer.push(&buf[..bytes_read]).map_err(AGIError::ParseError)?;
        let mut records = records.into_iter();
        while let Some(line) = records.next() {
            if line.trim().is_empty() {
                return Ok((env, records.collect()));
            }
            match line.split_once(": ") {
                Some((key, value)) => {
                    env.insert(key, value.trim_end());
                }
                None => {
                    warn!("{}", AGIParseError::NoValue(line.clone()));
                }
            }
        }
    }
}

/// Settle the oldest pending request with the given reply line.
///
/// A line with no pending request is logged and discarded.
fn settle_reply(pending: &mut VecDeque<PendingRequest>, line: &str) {
    let request = match pending.pop_front() {
        Some(request) => request,
        None => {
            warn!(line, "line received without pending request");
            return;
        }
    };
    let outcome = match line.get(..11) {
        Some(prefix) if prefix.eq_ignore_ascii_case("200 result=") => {
            parse_result(&request.name, &line[11..])
        }
        _ => {
            let (code, message) = match line.split_once(' ') {
                Some((code, text)) => (code.parse::<u16>().unwrap_or(500), text.to_owned()),
                None => (500, line.to_owned()),
            };
            Err(AGIError::CommandFailure {
                code,
                message,
                command: None,
            })
        }
    };
    let _ = request.reply.send(outcome);
}

/// Per-connection pump: owns the transport and the FIFO of pending requests.
/// Every state transition of one session happens on this task.
pub(crate) async fn drive_session<S>(
    mut stream: S,
    mut control: mpsc::UnboundedReceiver<SessionMessage>,
    mut framer: LineFramer,
    leftover: VecDeque<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = VecDeque::<PendingRequest>::new();
    for line in leftover {
        settle_reply(&mut pending, &line);
    }
    let mut buf = [0_u8; 2048];
    loop {
        tokio::select! {
            message = control.recv() => match message {
                Some(SessionMessage::Command { line, name, reply }) => {
                    trace!(command = %line.trim_end(), "send command");
                    match stream.write_all(line.as_bytes()).await {
                        Ok(()) => pending.push_back(PendingRequest { name, reply }),
                        Err(e) => {
                            let _ = reply.send(Err(AGIError::CannotSendCommand(e)));
                        }
                    }
                }
                Some(SessionMessage::Finish) | None => break,
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    debug!("connection terminated by asterisk");
                    reject_pending(&mut pending);
                    return;
                }
                Ok(n) => match framer.push(&buf[..n]) {
                    Ok(records) => {
                        for line in records {
                            settle_reply(&mut pending, &line);
                        }
                    }
                    Err(error) => {
                        warn!(%error, "unparsable bytes from asterisk");
                        reject_pending(&mut pending);
                        return;
                    }
                },
            },
        }
    }
    // the handler finished (or its handle was dropped): EOF towards asterisk
    // signals successful termination
    reject_pending(&mut pending);
    let _ = stream.shutdown().await;
}

fn reject_pending(pending: &mut VecDeque<PendingRequest>) {
    for request in pending.drain(..) {
        let _ = request.reply.send(Err(AGIError::ConnectionTerminated));
    }
}

/// Timeouts are taken in seconds but transmitted in milliseconds.
fn as_millis(timeout: f64) -> i64 {
    (timeout * 1000.0) as i64
}

/// Convert a date to the epoch seconds asterisk expects.
fn date_as_seconds(date: SystemTime) -> Result<u64, AGIError> {
    date.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|_| AGIError::UndefinedTimeFormat(format!("{date:?}")))
}

/// For the stream family (`STREAM FILE`, `CONTROL STREAM FILE`, `GET OPTION`):
/// nominal success at stream position 0 means the file could not be opened,
/// and a non-default result is the ASCII code of the digit pressed.
fn check_stream_result(mut command: Command) -> Result<Command, AGIError> {
    if command.is_success() && command.endpos == Some(0) {
        return Err(AGIError::FailureOnOpen(command));
    }
    if !command.is_default() {
        command.convert_dtmf().map_err(AGIError::ParseError)?;
    }
    Ok(command)
}

/// For the say family: a non-default result is the digit that cut us short.
fn check_say_result(mut command: Command) -> Result<Command, AGIError> {
    if !command.is_default() {
        command.convert_dtmf().map_err(AGIError::ParseError)?;
    }
    Ok(command)
}

/// Handle to one FastAGI call session.
///
/// Carries the environment of the call and sends commands through the session
/// pump. All command methods settle once the matching reply line has been
/// parsed; issuing the next command before the previous one settled is fine.
#[derive(Debug)]
pub struct Connection {
    env: SessionEnv,
    url: Option<AGIUrl>,
    control: mpsc::UnboundedSender<SessionMessage>,
}
impl Connection {
    pub(crate) fn new(
        env: SessionEnv,
        url: Option<AGIUrl>,
        control: mpsc::UnboundedSender<SessionMessage>,
    ) -> Connection {
        Connection { env, url, control }
    }

    /// The environment variables asterisk sent for this call.
    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    /// The parsed `agi_request` URL, if it was present and parsable.
    pub fn url(&self) -> Option<&AGIUrl> {
        self.url.as_ref()
    }

    /// Send a raw AGI command and wait for its reply.
    ///
    /// The reply is classified against the command catalogue: a failure code
    /// surfaces as [`AGIError::CommandFailure`] carrying the parsed
    /// [`Command`]. The DTMF post-processing of the specialized methods is
    /// *not* applied here.
    pub async fn send_command(&self, name: &str, args: Option<&str>) -> Result<Command, AGIError> {
        let name = name.to_ascii_uppercase();
        let line = match args {
            Some(args) => format!("{name} {args}\n"),
            None => format!("{name}\n"),
        };
        let (reply, settled) = oneshot::channel();
        self.control
            .send(SessionMessage::Command { line, name, reply })
            .map_err(|_| AGIError::ConnectionTerminated)?;
        settled.await.map_err(|_| AGIError::ConnectionTerminated)?
    }

    /// Finish the AGI scenario (drop the connection).
    ///
    /// Asterisk interprets the EOF as a successful termination.
    pub fn finish(&self) {
        let _ = self.control.send(SessionMessage::Finish);
    }

    /// Sleep for the given duration. Does not talk to asterisk.
    pub async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Answer the channel if it is not already in answer state.
    ///
    /// Success: `200 result=0`
    /// Failure: `200 result=-1`
    pub async fn answer(&self) -> Result<Command, AGIError> {
        self.send_command("ANSWER", None).await
    }

    /// Return the status of the given channel (default: the current one).
    ///
    /// Success: `200 result=<status>`, decodable with
    /// [`ChannelStatus::from_result`](crate::command::ChannelStatus::from_result)
    /// Failure: `200 result=-1`
    pub async fn channel_status(&self, channel: Option<&str>) -> Result<Command, AGIError> {
        self.send_command("CHANNEL STATUS", channel).await
    }

    /// Send the given file, allowing playback to be controlled by the given
    /// digits. The file extension must not be included in the filename; an
    /// empty escape mask permits none.
    ///
    /// Success: `200 result=0 endpos=<offset>`
    /// Digit pressed: `200 result=<digit> endpos=<offset>`
    /// Failure: `200 result=-1 endpos=<offset>`
    /// Failure on open: `200 result=0 endpos=0`
    pub async fn control_stream_file(
        &self,
        filename: &str,
        escape_digits: &str,
        skip_ms: u32,
        ff_char: char,
        rew_char: char,
        pause_char: Option<char>,
    ) -> Result<Command, AGIError> {
        let mut args =
            format!("{filename} \"{escape_digits}\" {skip_ms} \"{ff_char}\" \"{rew_char}\"");
        if let Some(pause) = pause_char {
            args.push_str(&format!(" \"{pause}\""));
        }
        let command = self.send_command("CONTROL STREAM FILE", Some(&args)).await?;
        check_stream_result(command)
    }

    /// Delete an entry in the asterisk database.
    ///
    /// Success: `200 result=1`
    /// Failure: `200 result=0`
    pub async fn database_del(&self, family: &str, key: &str) -> Result<Command, AGIError> {
        let args = format!("{family} {key}");
        self.send_command("DATABASE DEL", Some(&args)).await
    }

    /// Delete a family, or a specific key tree within a family, in the
    /// asterisk database.
    ///
    /// Success: `200 result=1`
    /// Failure: `200 result=0`
    pub async fn database_deltree(
        &self,
        family: &str,
        key_tree: Option<&str>,
    ) -> Result<Command, AGIError> {
        let args = match key_tree {
            Some(key_tree) => format!("{family} {key_tree}"),
            None => family.to_owned(),
        };
        self.send_command("DATABASE DELTREE", Some(&args)).await
    }

    /// Retrieve an entry from the asterisk database. The value arrives in
    /// `extra`.
    ///
    /// Success: `200 result=1 (<value>)`
    /// Failure or key not set: `200 result=0`
    pub async fn database_get(&self, family: &str, key: &str) -> Result<Command, AGIError> {
        let args = format!("{family} {key}");
        self.send_command("DATABASE GET", Some(&args)).await
    }

    /// Add or update an entry in the asterisk database.
    ///
    /// Success: `200 result=1 (<value>)`
    /// Failure: `200 result=0`
    pub async fn database_put(
        &self,
        family: &str,
        key: &str,
        value: &str,
    ) -> Result<Command, AGIError> {
        let args = format!("{family} {key} {value}");
        self.send_command("DATABASE PUT", Some(&args)).await
    }

    /// Execute a dialplan application with the given options. Options are
    /// joined with the pipe character, as the application expects:
    /// `EXEC Dial "IAX2/alice|20"`.
    ///
    /// Success: `200 result=<ret>` (whatever the application returns)
    /// Failure: `200 result=-2`
    pub async fn exec(&self, application: &str, options: &[&str]) -> Result<Command, AGIError> {
        let mut args = application.to_owned();
        if !options.is_empty() {
            args.push_str(&format!(" \"{}\"", options.join("|")));
        }
        self.send_command("EXEC", Some(&args)).await
    }

    /// Stream the given file and receive DTMF data. Unlike
    /// [`stream_file`](Self::stream_file) this collects many digits; the
    /// pound key ends the command early. `timeout` is the silence timeout in
    /// seconds.
    ///
    /// Success: `200 result=<digits>`
    /// Timeout: `200 result=<digits> (timeout)`
    /// Failure: `200 result=-1`
    pub async fn get_data(
        &self,
        filename: &str,
        timeout: f64,
        max_digits: Option<u32>,
    ) -> Result<Command, AGIError> {
        let mut args = format!("{filename} {}", as_millis(timeout));
        if let Some(max_digits) = max_digits {
            args.push_str(&format!(" {max_digits}"));
        }
        self.send_command("GET DATA", Some(&args)).await
    }

    /// Evaluate an expression, optionally in another channel. Understands
    /// complex variable names and builtin variables, unlike
    /// [`get_variable`](Self::get_variable).
    ///
    /// Success: `200 result=1 <value>`
    /// Failure or not set: `200 result=0`
    pub async fn get_full_variable(
        &self,
        name: &str,
        channel: Option<&str>,
    ) -> Result<Command, AGIError> {
        let args = match channel {
            Some(channel) => format!("{name} {channel}"),
            None => name.to_owned(),
        };
        self.send_command("GET FULL VARIABLE", Some(&args)).await
    }

    /// Behaves like [`stream_file`](Self::stream_file) with an additional
    /// timeout (seconds) after playback.
    ///
    /// Success: `200 result=0 endpos=<offset>`
    /// Digit pressed: `200 result=<digit> endpos=<offset>`
    /// Failure: `200 result=-1 endpos=0`
    /// Failure on open: `200 result=0 endpos=0`
    pub async fn get_option(
        &self,
        filename: &str,
        escape_digits: &str,
        timeout: Option<f64>,
    ) -> Result<Command, AGIError> {
        let mut args = format!("{filename} \"{escape_digits}\"");
        if let Some(timeout) = timeout {
            args.push_str(&format!(" {}", as_millis(timeout)));
        }
        let command = self.send_command("GET OPTION", Some(&args)).await?;
        check_stream_result(command)
    }

    /// Get the value of a channel variable or function. The value arrives in
    /// `extra`.
    ///
    /// Success: `200 result=1 <value>`
    /// Failure or not set: `200 result=0`
    pub async fn get_variable(&self, name: &str) -> Result<Command, AGIError> {
        self.send_command("GET VARIABLE", Some(name)).await
    }

    /// Hang up the given channel (default: the current one).
    ///
    /// Success: `200 result=1`
    /// Failure: `200 result=-1`
    pub async fn hangup(&self, channel: Option<&str>) -> Result<Command, AGIError> {
        self.send_command("HANGUP", channel).await
    }

    /// Does nothing.
    ///
    /// Success: `200 result=0`
    pub async fn noop(&self) -> Result<Command, AGIError> {
        self.send_command("NOOP", None).await
    }

    /// Receive one character of text on the channel. Most channels do not
    /// support text reception. `timeout` in seconds.
    ///
    /// Success: `200 result=<char>`
    /// Timeout: `200 result=<char> (timeout)`
    /// Failure or hangup: `200 result=-1 (hangup)`
    pub async fn receive_char(&self, timeout: Option<f64>) -> Result<Command, AGIError> {
        let args = timeout.map(|t| as_millis(t).to_string());
        self.send_command("RECEIVE CHAR", args.as_deref()).await
    }

    /// Receive a string of text on the channel. `timeout` is the maximum wait
    /// in seconds, 0 for infinite.
    ///
    /// Success: `200 result=<text>`
    /// Failure, hangup or timeout: `200 result=-1`
    pub async fn receive_text(&self, timeout: Option<f64>) -> Result<Command, AGIError> {
        let args = timeout.map(|t| as_millis(t).to_string());
        self.send_command("RECEIVE TEXT", args.as_deref()).await
    }

    /// Record to a file until the escape digits are received. `timeout` is
    /// the maximum recording time in seconds, -1 for no limit; `silence`, if
    /// given, ends the recording after that many seconds of silence.
    ///
    /// Hangup: `200 result=0 (hangup) endpos=<offset>`
    /// Interrupted: `200 result=<digit> (dtmf) endpos=<offset>`
    /// Timeout: `200 result=0 (timeout) endpos=<offset>`
    /// Failure to write: `200 result=-1 (writefile)`
    /// Failure on waitfor: `200 result=-1 (waitfor) endpos=<offset>`
    #[allow(clippy::too_many_arguments)]
    pub async fn record_file(
        &self,
        filename: &str,
        format: &str,
        escape_digits: &str,
        timeout: f64,
        offset_samples: Option<u32>,
        beep: bool,
        silence: Option<u32>,
    ) -> Result<Command, AGIError> {
        let mut args = format!(
            "{filename} {format} \"{escape_digits}\" {}",
            as_millis(timeout)
        );
        if let Some(offset_samples) = offset_samples {
            args.push_str(&format!(" {offset_samples}"));
        }
        if beep {
            args.push_str(" BEEP");
        }
        if let Some(silence) = silence {
            args.push_str(&format!(" s={silence}"));
        }
        self.send_command("RECORD FILE", Some(&args)).await
    }

    async fn say(
        &self,
        name: &str,
        args: String,
        escape_digits: &str,
    ) -> Result<Command, AGIError> {
        let args = format!("{args} \"{escape_digits}\"");
        let command = self.send_command(name, Some(&args)).await?;
        check_say_result(command)
    }

    /// Say a character string, returning early if one of the escape digits is
    /// pressed. Non-alphanumeric characters are dropped from the string.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_alpha(
        &self,
        characters: &str,
        escape_digits: &str,
    ) -> Result<Command, AGIError> {
        let filtered: String = characters
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        self.say("SAY ALPHA", filtered, escape_digits).await
    }

    /// Say a date, returning early if one of the escape digits is pressed.
    /// Fails with [`AGIError::UndefinedTimeFormat`] before transmitting
    /// anything if the date precedes the epoch.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_date(
        &self,
        date: SystemTime,
        escape_digits: &str,
    ) -> Result<Command, AGIError> {
        let seconds = date_as_seconds(date)?;
        self.say("SAY DATE", seconds.to_string(), escape_digits)
            .await
    }

    /// Say a date and time, returning early if one of the escape digits is
    /// pressed. `format` is a voicemail.conf-style pattern (defaults to
    /// `ABdY 'digits/at' IMp` on the asterisk side); `timezone` as found under
    /// /usr/share/zoneinfo.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_datetime(
        &self,
        time: SystemTime,
        escape_digits: &str,
        format: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<Command, AGIError> {
        let mut args = date_as_seconds(time)?.to_string();
        if let Some(format) = format {
            args.push_str(&format!(" {format}"));
        }
        if let Some(timezone) = timezone {
            args.push_str(&format!(" {timezone}"));
        }
        self.say("SAY DATETIME", args, escape_digits).await
    }

    /// Say a digit string, returning early if one of the escape digits is
    /// pressed. Non-digit characters are dropped.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_digits(&self, digits: &str, escape_digits: &str) -> Result<Command, AGIError> {
        let filtered: String = digits.chars().filter(|c| c.is_ascii_digit()).collect();
        self.say("SAY DIGITS", filtered, escape_digits).await
    }

    /// Say a number, returning early if one of the escape digits is pressed.
    /// Non-digit characters are dropped.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_number(&self, number: &str, escape_digits: &str) -> Result<Command, AGIError> {
        let filtered: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        self.say("SAY NUMBER", filtered, escape_digits).await
    }

    /// Say a character string with phonetics, returning early if one of the
    /// escape digits is pressed. Non-alphanumeric characters are dropped.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_phonetic(
        &self,
        characters: &str,
        escape_digits: &str,
    ) -> Result<Command, AGIError> {
        let filtered: String = characters
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        self.say("SAY PHONETIC", filtered, escape_digits).await
    }

    /// Say a time, returning early if one of the escape digits is pressed.
    /// Fails with [`AGIError::UndefinedTimeFormat`] before transmitting
    /// anything if the time precedes the epoch.
    ///
    /// Success: `200 result=0`
    /// Digit pressed: `200 result=<digit>`
    /// Failure: `200 result=-1`
    pub async fn say_time(
        &self,
        time: SystemTime,
        escape_digits: &str,
    ) -> Result<Command, AGIError> {
        let seconds = date_as_seconds(time)?;
        self.say("SAY TIME", seconds.to_string(), escape_digits)
            .await
    }

    /// Send an image on the channel. Most channels do not support this. The
    /// filename must not include an extension.
    ///
    /// Success: `200 result=0`
    /// Failure: `200 result=-1`
    pub async fn send_image(&self, filename: &str) -> Result<Command, AGIError> {
        self.send_command("SEND IMAGE", Some(filename)).await
    }

    /// Send text on the channel. Most channels do not support this.
    ///
    /// Success: `200 result=0`
    /// Failure: `200 result=-1`
    pub async fn send_text(&self, text: &str) -> Result<Command, AGIError> {
        let args = format!("\"{text}\"");
        self.send_command("SEND TEXT", Some(&args)).await
    }

    /// Hang up the channel automatically `time` seconds in the future, 0 to
    /// disable.
    ///
    /// Always: `200 result=0`
    pub async fn set_autohangup(&self, time: u32) -> Result<Command, AGIError> {
        self.send_command("SET AUTOHANGUP", Some(&time.to_string()))
            .await
    }

    /// Change the caller id of the current channel.
    ///
    /// Always: `200 result=1`
    pub async fn set_callerid(&self, number: &str) -> Result<Command, AGIError> {
        self.send_command("SET CALLERID", Some(number)).await
    }

    /// Set the context for continuation upon exiting the application. No
    /// checking is done: an invalid context drops the call.
    ///
    /// Always: `200 result=0`
    pub async fn set_context(&self, context: &str) -> Result<Command, AGIError> {
        self.send_command("SET CONTEXT", Some(context)).await
    }

    /// Change the extension for continuation upon exiting the application.
    /// If it does not exist, the PBX moves to the `i` extension, or drops.
    ///
    /// Always: `200 result=0`
    pub async fn set_extension(&self, extension: &str) -> Result<Command, AGIError> {
        self.send_command("SET EXTENSION", Some(extension)).await
    }

    /// Enable or disable the music-on-hold generator, optionally with a music
    /// class other than the default.
    ///
    /// Always: `200 result=0`
    pub async fn set_music(&self, on: bool, music_class: Option<&str>) -> Result<Command, AGIError> {
        let mut args = if on { "ON" } else { "OFF" }.to_owned();
        if let Some(music_class) = music_class {
            args.push_str(&format!(" {music_class}"));
        }
        self.send_command("SET MUSIC", Some(&args)).await
    }

    /// Change the priority for continuation upon exiting the application.
    ///
    /// Always: `200 result=0`
    pub async fn set_priority(&self, priority: u16) -> Result<Command, AGIError> {
        self.send_command("SET PRIORITY", Some(&priority.to_string()))
            .await
    }

    /// Set a channel variable. Works for writable functions too.
    ///
    /// Always: `200 result=1`
    pub async fn set_variable(&self, name: &str, value: &str) -> Result<Command, AGIError> {
        let args = format!("{name} \"{value}\"");
        self.send_command("SET VARIABLE", Some(&args)).await
    }

    /// Send the given file, allowing playback to be interrupted by the given
    /// digits. The file extension must not be included in the filename; an
    /// empty escape mask permits none. A non-zero `offset` seeks to that
    /// sample before playback.
    ///
    /// Success: `200 result=0 endpos=<offset>`
    /// Digit pressed: `200 result=<digit> endpos=<offset>`
    /// Failure: `200 result=-1 endpos=<sample offset>`
    /// Failure on open: `200 result=0 endpos=0`
    pub async fn stream_file(
        &self,
        filename: &str,
        escape_digits: &str,
        offset: u32,
    ) -> Result<Command, AGIError> {
        let mut args = format!("{filename} \"{escape_digits}\"");
        if offset != 0 {
            args.push_str(&format!(" {offset}"));
        }
        let command = self.send_command("STREAM FILE", Some(&args)).await?;
        check_stream_result(command)
    }

    /// Enable (`Some(true)`), disable (`Some(false)`) or set to MATE mode
    /// (`None`) TDD transmission on the channel.
    ///
    /// Success: `200 result=1`
    /// Not capable: `200 result=0`
    /// Failure: `200 result=-1`
    pub async fn tdd_mode(&self, mode: Option<bool>) -> Result<Command, AGIError> {
        let token = match mode {
            Some(true) => "ON",
            Some(false) => "OFF",
            None => "MATE",
        };
        self.send_command("TDD MODE", Some(token)).await
    }

    /// Send a message to the asterisk console via the verbose message system.
    /// `level` is 1-4.
    ///
    /// Always: `200 result=1`
    pub async fn verbose(&self, message: &str, level: Option<u8>) -> Result<Command, AGIError> {
        let mut args = format!("\"{message}\"");
        if let Some(level) = level {
            args.push_str(&format!(" {level}"));
        }
        self.send_command("VERBOSE", Some(&args)).await
    }

    /// Wait up to `timeout` seconds (-1 for no limit) for a single DTMF
    /// digit. The pressed digit arrives as the decoded `result`; running out
    /// of time is [`AGIError::CommandTimeout`].
    ///
    /// Digit pressed: `200 result=<digit>`
    /// Timeout: `200 result=0`
    /// Failure: `200 result=-1`
    pub async fn wait_for_digit(&self, timeout: f64) -> Result<Command, AGIError> {
        let args = as_millis(timeout).to_string();
        let mut command = self.send_command("WAIT FOR DIGIT", Some(&args)).await?;
        if !command.is_default() {
            command.convert_dtmf().map_err(AGIError::ParseError)?;
            Ok(command)
        } else if command.is_success() {
            Err(AGIError::CommandTimeout(command))
        } else {
            Err(AGIError::CommandFailure {
                code: 200,
                message: String::new(),
                command: Some(command),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    /// Spawn a session pump over an in-memory stream, returning the handle
    /// and the asterisk-side end.
    fn start_session() -> (Connection, DuplexStream) {
        let (ours, theirs) = duplex(4096);
        let (control, commands) = mpsc::unbounded_channel();
        tokio::spawn(drive_session(
            ours,
            commands,
            LineFramer::lf(),
            VecDeque::new(),
        ));
        (Connection::new(SessionEnv::new(), None, control), theirs)
    }

    async fn expect_and_reply(peer: &mut BufReader<DuplexStream>, expected: &str, reply: &str) {
        let mut line = String::new();
        peer.read_line(&mut line).await.unwrap();
        assert_eq!(line, format!("{expected}\n"));
        peer.get_mut().write_all(reply.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn environment_handshake_then_answer() {
        let (mut ours, mut theirs) = duplex(4096);
        theirs
            .write_all(b"agi_channel: SIP/tester\nagi_callerid: Tester\n\n")
            .await
            .unwrap();
        let mut framer = LineFramer::lf();
        let (env, leftover) = read_environment(&mut ours, &mut framer).await.unwrap();
        assert_eq!(env.channel(), Some("SIP/tester"));
        assert_eq!(env.callerid(), Some("Tester"));
        assert!(leftover.is_empty());

        let (control, commands) = mpsc::unbounded_channel();
        tokio::spawn(drive_session(ours, commands, framer, leftover));
        let connection = Connection::new(env, None, control);

        let mut peer = BufReader::new(theirs);
        let (answered, ()) = tokio::join!(connection.answer(), async {
            expect_and_reply(&mut peer, "ANSWER", "200 result=0\n").await;
        });
        assert_eq!(
            answered.unwrap(),
            Command::new("ANSWER", "0".to_owned(), None, None)
        );
    }

    #[tokio::test]
    async fn environment_values_are_lowercased_and_stripped() {
        let (mut ours, mut theirs) = duplex(4096);
        theirs
            .write_all(b"AGI_Language: en \nagi_accountcode: \nnot-a-variable\n\n")
            .await
            .unwrap();
        let mut framer = LineFramer::lf();
        let (env, _) = read_environment(&mut ours, &mut framer).await.unwrap();
        assert_eq!(env.language(), Some("en"));
        assert_eq!(env.accountcode(), Some(""));
        assert_eq!(env.len(), 2);
    }

    #[tokio::test]
    async fn stream_file_digit_pressed() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (played, ()) = tokio::join!(connection.stream_file("test_audio", "", 0), async {
            expect_and_reply(
                &mut peer,
                "STREAM FILE test_audio \"\"",
                "200 result=55 endpos=123\n",
            )
            .await;
        });
        let command = played.unwrap();
        assert_eq!(command.result, "7");
        assert_eq!(command.endpos, Some(123));
        assert!(command.has_dtmf());
    }

    #[tokio::test]
    async fn stream_file_failure_on_open() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (played, ()) = tokio::join!(connection.stream_file("test_audio", "", 0), async {
            expect_and_reply(
                &mut peer,
                "STREAM FILE test_audio \"\"",
                "200 result=0 endpos=0\n",
            )
            .await;
        });
        assert!(matches!(played, Err(AGIError::FailureOnOpen(_))));
    }

    #[tokio::test]
    async fn stream_file_failure() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (played, ()) = tokio::join!(connection.stream_file("foo", "", 0), async {
            expect_and_reply(
                &mut peer,
                "STREAM FILE foo \"\"",
                "200 result=-1 endpos=123\n",
            )
            .await;
        });
        match played {
            Err(AGIError::CommandFailure {
                command: Some(command),
                ..
            }) => {
                assert_eq!(command.result, "-1");
                assert_eq!(command.endpos, Some(123));
            }
            other => panic!("expected CommandFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_file_with_offset() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (played, ()) = tokio::join!(connection.stream_file("test_audio", "12", 160), async {
            expect_and_reply(
                &mut peer,
                "STREAM FILE test_audio \"12\" 160",
                "200 result=0 endpos=800\n",
            )
            .await;
        });
        assert_eq!(played.unwrap().endpos, Some(800));
    }

    #[tokio::test]
    async fn wait_for_digit_timeout() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (waited, ()) = tokio::join!(connection.wait_for_digit(1.5), async {
            expect_and_reply(&mut peer, "WAIT FOR DIGIT 1500", "200 result=0\n").await;
        });
        assert!(matches!(waited, Err(AGIError::CommandTimeout(_))));
    }

    #[tokio::test]
    async fn wait_for_digit_pressed() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (waited, ()) = tokio::join!(connection.wait_for_digit(-1.0), async {
            expect_and_reply(&mut peer, "WAIT FOR DIGIT -1000", "200 result=55\n").await;
        });
        let command = waited.unwrap();
        assert_eq!(command.result, "7");
        assert!(command.has_dtmf());
    }

    #[tokio::test]
    async fn pipelined_commands_settle_in_order() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let client = async {
            let first = connection.noop();
            let second = connection.verbose("queued", None);
            tokio::join!(first, second)
        };
        let server = async {
            expect_and_reply(&mut peer, "NOOP", "200 result=0\n").await;
            expect_and_reply(&mut peer, "VERBOSE \"queued\"", "200 result=1\n").await;
        };
        let ((first, second), ()) = tokio::join!(client, server);
        assert_eq!(first.unwrap().name, "NOOP");
        assert_eq!(second.unwrap().name, "VERBOSE");
    }

    #[tokio::test]
    async fn connection_loss_rejects_pending() {
        let (connection, theirs) = start_session();
        let server = async move {
            let mut peer = BufReader::new(theirs);
            let mut line = String::new();
            peer.read_line(&mut line).await.unwrap();
            // remote hangup before any reply
        };
        let (hung_up, ()) = tokio::join!(connection.noop(), server);
        assert!(matches!(hung_up, Err(AGIError::ConnectionTerminated)));
    }

    #[tokio::test]
    async fn finish_closes_the_stream() {
        let (connection, theirs) = start_session();
        connection.finish();
        let mut peer = BufReader::new(theirs);
        let mut line = String::new();
        let bytes_read = peer.read_line(&mut line).await.unwrap();
        // EOF towards asterisk: normal termination
        assert_eq!(bytes_read, 0);
    }

    #[tokio::test]
    async fn finish_rejects_outstanding_commands() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let client = async {
            let pending = connection.noop();
            let finisher = async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                connection.finish();
            };
            let (finished, ()) = tokio::join!(pending, finisher);
            finished
        };
        let server = async {
            let mut line = String::new();
            peer.read_line(&mut line).await.unwrap();
            assert_eq!(line, "NOOP\n");
            // never reply; the handler side finishes the session instead
        };
        let (finished, ()) = tokio::join!(client, server);
        assert!(matches!(finished, Err(AGIError::ConnectionTerminated)));
    }

    #[tokio::test]
    async fn stray_line_is_discarded() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        peer.get_mut().write_all(b"200 result=1\n").await.unwrap();
        // give the pump a chance to see (and drop) the stray reply
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (ok, ()) = tokio::join!(connection.noop(), async {
            expect_and_reply(&mut peer, "NOOP", "200 result=0\n").await;
        });
        assert_eq!(ok.unwrap().result, "0");
    }

    #[tokio::test]
    async fn non_200_reply_is_a_command_failure() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (rejected, ()) = tokio::join!(connection.noop(), async {
            expect_and_reply(&mut peer, "NOOP", "510 Invalid or unknown command\n").await;
        });
        match rejected {
            Err(AGIError::CommandFailure {
                code,
                message,
                command: None,
            }) => {
                assert_eq!(code, 510);
                assert_eq!(message, "Invalid or unknown command");
            }
            other => panic!("expected CommandFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparsable_error_code_falls_back_to_500() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (rejected, ()) = tokio::join!(connection.noop(), async {
            expect_and_reply(&mut peer, "NOOP", "HUH what was that\n").await;
        });
        match rejected {
            Err(AGIError::CommandFailure { code, message, .. }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "what was that");
            }
            other => panic!("expected CommandFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_data_without_digit_limit() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (collected, ()) = tokio::join!(connection.get_data("test_audio", 2.0, None), async {
            expect_and_reply(&mut peer, "GET DATA test_audio 2000", "200 result=Xyz\n").await;
        });
        assert_eq!(collected.unwrap().result, "Xyz");
    }

    #[tokio::test]
    async fn get_data_timeout_flag_arrives_in_extra() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (collected, ()) =
            tokio::join!(connection.get_data("test_audio", 2.0, Some(4)), async {
                expect_and_reply(
                    &mut peer,
                    "GET DATA test_audio 2000 4",
                    "200 result=Xyz (timeout)\n",
                )
                .await;
            });
        let command = collected.unwrap();
        assert_eq!(command.result, "Xyz");
        assert_eq!(command.extra.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn database_deltree_without_key_tree_sends_family_only() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (deleted, ()) = tokio::join!(connection.database_deltree("test", None), async {
            expect_and_reply(&mut peer, "DATABASE DELTREE test", "200 result=1\n").await;
        });
        assert!(deleted.unwrap().is_success());
    }

    #[tokio::test]
    async fn database_get_value_arrives_in_extra() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (fetched, ()) = tokio::join!(connection.database_get("test", "t_key"), async {
            expect_and_reply(
                &mut peer,
                "DATABASE GET test t_key",
                "200 result=1 (tEsT_vAl)\n",
            )
            .await;
        });
        assert_eq!(fetched.unwrap().extra.as_deref(), Some("tEsT_vAl"));
    }

    #[tokio::test]
    async fn exec_joins_options_with_pipes() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (ran, ()) = tokio::join!(connection.exec("Dial", &["IAX2/alice", "20"]), async {
            expect_and_reply(&mut peer, "EXEC Dial \"IAX2/alice|20\"", "200 result=1\n").await;
        });
        assert_eq!(ran.unwrap().result, "1");
    }

    #[tokio::test]
    async fn say_alpha_filters_to_alphanumerics() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (said, ()) = tokio::join!(connection.say_alpha("pre!ved 66", "#"), async {
            expect_and_reply(&mut peer, "SAY ALPHA preved66 \"#\"", "200 result=0\n").await;
        });
        assert!(said.unwrap().is_success());
    }

    #[tokio::test]
    async fn say_digits_digit_pressed_is_decoded() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (said, ()) = tokio::join!(connection.say_digits("123-41", ""), async {
            expect_and_reply(&mut peer, "SAY DIGITS 12341 \"\"", "200 result=55\n").await;
        });
        let command = said.unwrap();
        assert_eq!(command.result, "7");
        assert!(command.has_dtmf());
    }

    #[tokio::test]
    async fn say_date_before_epoch_fails_synchronously() {
        let (connection, _theirs) = start_session();
        let too_early = UNIX_EPOCH - Duration::from_secs(1);
        let result = connection.say_date(too_early, "").await;
        assert!(matches!(result, Err(AGIError::UndefinedTimeFormat(_))));
    }

    #[tokio::test]
    async fn say_datetime_appends_format_and_timezone() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let moment = UNIX_EPOCH + Duration::from_secs(1_300_000_000);
        let (said, ()) = tokio::join!(
            connection.say_datetime(moment, "", Some("MdY"), Some("UTC")),
            async {
                expect_and_reply(
                    &mut peer,
                    "SAY DATETIME 1300000000 MdY UTC \"\"",
                    "200 result=0\n",
                )
                .await;
            }
        );
        assert!(said.unwrap().is_success());
    }

    #[tokio::test]
    async fn record_file_flags_and_timeout() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (recorded, ()) = tokio::join!(
            connection.record_file("test_audio", "wav", "*", -1.0, None, true, None),
            async {
                expect_and_reply(
                    &mut peer,
                    "RECORD FILE test_audio wav \"*\" -1000 BEEP",
                    "200 result=0 (timeout) endpos=123456\n",
                )
                .await;
            }
        );
        let command = recorded.unwrap();
        assert_eq!(command.extra.as_deref(), Some("timeout"));
        assert_eq!(command.endpos, Some(123456));
    }

    #[tokio::test]
    async fn tdd_mode_tristate_tokens() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let client = async {
            connection.tdd_mode(None).await.unwrap();
            connection.tdd_mode(Some(true)).await.unwrap();
            connection.tdd_mode(Some(false)).await
        };
        let server = async {
            expect_and_reply(&mut peer, "TDD MODE MATE", "200 result=1\n").await;
            expect_and_reply(&mut peer, "TDD MODE ON", "200 result=1\n").await;
            expect_and_reply(&mut peer, "TDD MODE OFF", "200 result=1\n").await;
        };
        let (last, ()) = tokio::join!(client, server);
        assert!(last.unwrap().is_success());
    }

    #[tokio::test]
    async fn set_music_on_with_class() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (set, ()) = tokio::join!(connection.set_music(true, Some("jazz")), async {
            expect_and_reply(&mut peer, "SET MUSIC ON jazz", "200 result=0\n").await;
        });
        assert!(set.unwrap().is_success());
    }

    #[tokio::test]
    async fn set_variable_quotes_the_value() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (set, ()) = tokio::join!(connection.set_variable("GROUP", "outbound"), async {
            expect_and_reply(&mut peer, "SET VARIABLE GROUP \"outbound\"", "200 result=1\n").await;
        });
        assert!(set.unwrap().is_success());
    }

    #[tokio::test]
    async fn channel_status_reports_dialed() {
        let (connection, theirs) = start_session();
        let mut peer = BufReader::new(theirs);
        let (status, ()) = tokio::join!(connection.channel_status(None), async {
            expect_and_reply(&mut peer, "CHANNEL STATUS", "200 result=3\n").await;
        });
        let command = status.unwrap();
        assert_eq!(
            crate::command::ChannelStatus::from_result(&command.result),
            Some(crate::command::ChannelStatus::DigitsDialed)
        );
    }
}
