use crate::blacklist::{Admission, QueryBlacklist};
use crate::scpi_terminal::{ScpiTransport, StreamTerminal, TerminalError, SCPI_RAW_PORT};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

/// Produces a fresh transport; called at connect time and on every reconnect.
pub type Connector = Box<dyn FnMut() -> Result<Box<dyn ScpiTransport>, TerminalError> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Command without a response.
    Write(String),
    /// Query answered by one text line.
    Query(String),
    /// Query answered by an IEEE 488.2 binary block.
    BlockQuery(String),
}

impl Command {
    pub fn write(text: impl Into<String>) -> Self {
        Self::Write(text.into())
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::Query(text.into())
    }

    pub fn block_query(text: impl Into<String>) -> Self {
        Self::BlockQuery(text.into())
    }

    /// Classify a line typed into a manual command console.
    pub fn from_console(line: &str) -> Self {
        let line = line.trim();
        let header = line.split_whitespace().next().unwrap_or(line).to_ascii_uppercase();
        if header.ends_with(":DATA?") {
            Self::BlockQuery(line.to_string())
        } else if header.contains('?') {
            Self::Query(line.to_string())
        } else {
            Self::Write(line.to_string())
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Write(t) | Self::Query(t) | Self::BlockQuery(t) => t,
        }
    }

    /// Command header without its arguments, used as the blacklist key.
    pub fn template(&self) -> &str {
        let text = self.text().trim();
        text.split_whitespace().next().unwrap_or(text)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Text(String),
    Block(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Query '{template}' timed out ({attempts} attempts)")]
    Timeout { template: String, attempts: u32 },

    #[error("Query '{template}' is blacklisted{}", describe_cooldown(.remaining))]
    Blacklisted {
        template: String,
        remaining: Option<Duration>,
    },

    #[error("Instrument disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Invalid response to '{template}': {reason}")]
    InvalidResponse { template: String, reason: String },

    #[error("Instrument link busy")]
    Busy,

    #[error("Terminal error: {0}")]
    Terminal(#[from] TerminalError),
}

fn describe_cooldown(remaining: &Option<Duration>) -> String {
    match remaining {
        Some(r) => format!(" for another {:.1}s", r.as_secs_f64()),
        None => " permanently".to_string(),
    }
}

impl LinkError {
    pub fn invalid(template: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            template: template.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkPolicy {
    /// Per text query.
    pub timeout: Duration,
    /// Per binary block transfer.
    pub block_timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Wire attempts a single call may spend on timeouts.
    pub attempts_per_call: u32,
    pub seed_known_bad: bool,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(20),
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            attempts_per_call: 3,
            seed_known_bad: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Analog(u8),
    Math(u8),
}

impl Channel {
    /// Mnemonic as used by `:WAV:SOUR` and channel subsystems.
    pub fn scpi_name(self) -> String {
        match self {
            Self::Analog(n) => format!("CHAN{}", n),
            Self::Math(n) => format!("MATH{}", n),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analog(n) => write!(f, "CH{}", n),
            Self::Math(n) => write!(f, "MATH{}", n),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    /// Accepts `1`, `CH1`, `CHAN1`, `MATH1` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let (is_math, digits) = if let Some(rest) = upper.strip_prefix("MATH") {
            (true, rest)
        } else if let Some(rest) = upper.strip_prefix("CHAN") {
            (false, rest)
        } else if let Some(rest) = upper.strip_prefix("CH") {
            (false, rest)
        } else {
            (false, upper.as_str())
        };
        match digits.parse::<u8>() {
            Ok(n @ 1..=4) if is_math => Ok(Self::Math(n)),
            Ok(n @ 1..=4) => Ok(Self::Analog(n)),
            _ => Err(format!("invalid channel '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelUnit {
    Volt,
    Amp,
    Watt,
    Unknown,
}

impl ChannelUnit {
    pub fn parse(response: &str) -> Self {
        match response.trim().to_ascii_uppercase().as_str() {
            "VOLT" | "V" => Self::Volt,
            "AMP" | "A" => Self::Amp,
            "WATT" | "W" => Self::Watt,
            _ => Self::Unknown,
        }
    }
}

/// Vertical setup of one channel as reported by the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub displayed: bool,
    pub unit: ChannelUnit,
    pub scale: f64,
    pub offset: f64,
    pub coupling: String,
    pub probe_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

struct LinkInner {
    transport: Option<Box<dyn ScpiTransport>>,
    state: LinkState,
    disconnect_reason: String,
    blacklist: QueryBlacklist,
    identity: String,
}

enum ExchangeFailure {
    Timeout,
    Invalid(String),
    ConnectionLost(String),
    Other(TerminalError),
}

impl From<TerminalError> for ExchangeFailure {
    fn from(e: TerminalError) -> Self {
        if e.is_connection_loss() {
            return Self::ConnectionLost(e.to_string());
        }
        match e {
            TerminalError::Timeout { .. } => Self::Timeout,
            TerminalError::MalformedBlock(reason) => Self::Invalid(reason),
            TerminalError::Utf8(e) => Self::Invalid(e.to_string()),
            other => Self::Other(other),
        }
    }
}

impl LinkInner {
    fn mark_disconnected(&mut self, reason: String) {
        log::warn!("Instrument link lost: {}", reason);
        self.transport = None;
        self.state = LinkState::Disconnected;
        self.disconnect_reason = reason;
    }

    fn exchange(&mut self, command: &Command, policy: &LinkPolicy) -> Result<Response, ExchangeFailure> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ExchangeFailure::ConnectionLost("no transport".to_string()));
        };
        transport.send_line(command.text())?;
        match command {
            Command::Write(_) => Ok(Response::Ack),
            Command::Query(_) => {
                let line = transport.read_line(policy.timeout)?;
                let line = line.trim();
                if line.is_empty() {
                    return Err(ExchangeFailure::Invalid("empty response".to_string()));
                }
                Ok(Response::Text(line.to_string()))
            }
            Command::BlockQuery(_) => Ok(Response::Block(transport.read_block(policy.block_timeout)?)),
        }
    }

    fn execute(&mut self, command: &Command, policy: &LinkPolicy) -> Result<Response, LinkError> {
        if self.state == LinkState::Disconnected {
            return Err(LinkError::Disconnected {
                reason: self.disconnect_reason.clone(),
            });
        }

        let template = command.template().to_string();
        let mut attempts = 0;
        loop {
            match self.blacklist.admission(&template, Instant::now()) {
                Admission::Permanent => {
                    log::debug!("Skipped blacklisted SCPI: {}", template);
                    return Err(LinkError::Blacklisted {
                        template,
                        remaining: None,
                    });
                }
                Admission::CoolingDown { .. } if attempts > 0 => {
                    return Err(LinkError::Timeout { template, attempts });
                }
                Admission::CoolingDown { remaining } => {
                    log::debug!("Skipped blacklisted SCPI: {}", template);
                    return Err(LinkError::Blacklisted {
                        template,
                        remaining: Some(remaining),
                    });
                }
                Admission::Probe => log::info!("Cool-down over for '{}', retrying on the wire", template),
                Admission::Allowed => {}
            }

            attempts += 1;
            match self.exchange(command, policy) {
                Ok(response) => {
                    self.blacklist.record_success(&template);
                    return Ok(response);
                }
                Err(ExchangeFailure::Timeout) => {
                    let armed = self.blacklist.record_failure(&template, Instant::now());
                    log::warn!(
                        "SCPI timeout [{}] ({} consecutive)",
                        template,
                        self.blacklist.failures(&template)
                    );
                    if armed {
                        log::warn!("Blacklisted: {}", template);
                    }
                    // A late answer would otherwise be read as the next reply.
                    if let Some(transport) = self.transport.as_mut() {
                        if let Err(e) = transport.clear_input() {
                            if e.is_connection_loss() {
                                self.mark_disconnected(e.to_string());
                                return Err(LinkError::Disconnected {
                                    reason: self.disconnect_reason.clone(),
                                });
                            }
                        }
                    }
                    if attempts >= policy.attempts_per_call {
                        return Err(LinkError::Timeout { template, attempts });
                    }
                }
                Err(ExchangeFailure::Invalid(reason)) => {
                    log::warn!("Invalid response to '{}': {}", template, reason);
                    return Err(LinkError::InvalidResponse { template, reason });
                }
                Err(ExchangeFailure::ConnectionLost(reason)) => {
                    self.mark_disconnected(reason);
                    return Err(LinkError::Disconnected {
                        reason: self.disconnect_reason.clone(),
                    });
                }
                Err(ExchangeFailure::Other(e)) => return Err(e.into()),
            }
        }
    }
}

/// The single, exclusively locked connection to the instrument.
pub struct InstrumentLink {
    inner: Mutex<LinkInner>,
    connector: Mutex<Connector>,
    policy: LinkPolicy,
    channels: RwLock<HashMap<Channel, ChannelConfig>>,
}

impl InstrumentLink {
    /// Connect through `connector` and read the instrument identity.
    pub fn connect(mut connector: Connector, policy: LinkPolicy) -> Result<Self, LinkError> {
        let transport = connector()?;
        let blacklist = if policy.seed_known_bad {
            QueryBlacklist::with_known_bad(policy.failure_threshold, policy.cooldown)
        } else {
            QueryBlacklist::new(policy.failure_threshold, policy.cooldown)
        };
        let link = Self {
            inner: Mutex::new(LinkInner {
                transport: Some(transport),
                state: LinkState::Connected,
                disconnect_reason: String::new(),
                blacklist,
                identity: String::new(),
            }),
            connector: Mutex::new(connector),
            policy,
            channels: RwLock::new(HashMap::new()),
        };
        let idn = link.exclusive()?.identify()?;
        log::info!("Connected: {}", idn);
        Ok(link)
    }

    /// Connect to the raw SCPI socket of a LAN instrument.
    pub fn connect_tcp(host: &str, policy: LinkPolicy) -> Result<Self, LinkError> {
        let host = host.to_string();
        let connect_timeout = policy.timeout;
        Self::connect(
            Box::new(move || {
                let terminal = StreamTerminal::connect_tcp((host.as_str(), SCPI_RAW_PORT), connect_timeout)?;
                Ok(Box::new(terminal) as Box<dyn ScpiTransport>)
            }),
            policy,
        )
    }

    /// Connect to a USB-serial SCPI port.
    pub fn connect_serial(port: &str, baud_rate: u32, policy: LinkPolicy) -> Result<Self, LinkError> {
        let port = port.to_string();
        Self::connect(
            Box::new(move || {
                let terminal = StreamTerminal::open_serial(&port, baud_rate)?;
                Ok(Box::new(terminal) as Box<dyn ScpiTransport>)
            }),
            policy,
        )
    }

    fn lock_inner(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the link and hold it for a multi-query sequence.
    pub fn exclusive(&self) -> Result<LinkSession<'_>, LinkError> {
        Ok(LinkSession {
            inner: self.lock_inner(),
            link: self,
        })
    }

    /// Like [`Self::exclusive`] but rejects with [`LinkError::Busy`] instead of queueing.
    pub fn try_exclusive(&self) -> Result<LinkSession<'_>, LinkError> {
        let inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(LinkError::Busy),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        Ok(LinkSession { inner, link: self })
    }

    pub fn execute(&self, command: Command) -> Result<Response, LinkError> {
        self.exclusive()?.execute(&command)
    }

    pub fn try_execute(&self, command: Command) -> Result<Response, LinkError> {
        self.try_exclusive()?.execute(&command)
    }

    pub fn state(&self) -> LinkState {
        self.lock_inner().state
    }

    pub fn identity(&self) -> String {
        self.lock_inner().identity.clone()
    }

    pub fn policy(&self) -> &LinkPolicy {
        &self.policy
    }

    /// Templates currently cooling down.
    pub fn blacklisted(&self) -> Vec<String> {
        self.lock_inner().blacklist.blocked(Instant::now())
    }

    pub fn block_permanently(&self, template: &str) {
        self.lock_inner().blacklist.block_permanently(template);
    }

    /// Drop the current transport and open a new one through the connector.
    pub fn reconnect(&self) -> Result<String, LinkError> {
        let mut inner = self.lock_inner();
        inner.transport = None;
        let attempt = {
            let mut connector = self.connector.lock().unwrap_or_else(PoisonError::into_inner);
            let connect = &mut **connector;
            connect()
        };
        match attempt {
            Ok(transport) => {
                inner.transport = Some(transport);
                inner.state = LinkState::Connected;
                inner.disconnect_reason.clear();
                let mut session = LinkSession { inner, link: self };
                let idn = session.identify()?;
                log::info!("Reconnected: {}", idn);
                Ok(idn)
            }
            Err(e) => {
                inner.mark_disconnected(format!("reconnect failed: {}", e));
                Err(LinkError::Disconnected {
                    reason: inner.disconnect_reason.clone(),
                })
            }
        }
    }

    /// Re-read one channel's vertical setup into the channel table.
    pub fn refresh_channel(&self, channel: Channel) -> Result<ChannelConfig, LinkError> {
        self.exclusive()?.refresh_channel(channel)
    }

    /// Last known setup of `channel`, if it was ever refreshed.
    pub fn channel_config(&self, channel: Channel) -> Option<ChannelConfig> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .cloned()
    }
}

/// Exclusive hold on the link; every query issued through it is serialized.
pub struct LinkSession<'a> {
    inner: MutexGuard<'a, LinkInner>,
    link: &'a InstrumentLink,
}

impl LinkSession<'_> {
    pub fn execute(&mut self, command: &Command) -> Result<Response, LinkError> {
        self.inner.execute(command, &self.link.policy)
    }

    pub fn write(&mut self, text: &str) -> Result<(), LinkError> {
        self.execute(&Command::write(text)).map(|_| ())
    }

    pub fn query(&mut self, text: &str) -> Result<String, LinkError> {
        let command = Command::query(text);
        match self.execute(&command)? {
            Response::Text(t) => Ok(t),
            other => Err(LinkError::invalid(command.template(), format!("unexpected {:?}", other))),
        }
    }

    pub fn query_f64(&mut self, text: &str) -> Result<f64, LinkError> {
        let response = self.query(text)?;
        response
            .trim()
            .parse::<f64>()
            .map_err(|_| LinkError::invalid(text, format!("not a number: '{}'", response)))
    }

    pub fn query_block(&mut self, text: &str) -> Result<Vec<u8>, LinkError> {
        let command = Command::block_query(text);
        match self.execute(&command)? {
            Response::Block(b) => Ok(b),
            other => Err(LinkError::invalid(command.template(), format!("unexpected {:?}", other))),
        }
    }

    /// Query that falls back to `default` when blacklisted, timed out or garbled.
    pub fn query_or(&mut self, text: &str, default: &str) -> Result<String, LinkError> {
        match self.query(text) {
            Ok(t) => Ok(t),
            Err(e @ LinkError::Disconnected { .. }) => Err(e),
            Err(e) => {
                log::debug!("Using default '{}' for {}: {}", default, text, e);
                Ok(default.to_string())
            }
        }
    }

    /// `*IDN?` answer from the last (re)connect.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    fn identify(&mut self) -> Result<String, LinkError> {
        let idn = self.query("*IDN?")?;
        self.inner.identity.clone_from(&idn);
        Ok(idn)
    }

    /// A unit that cannot be read stays `Unknown` so the probe scaling that
    /// follows is visible as a guess.
    fn query_unit(&mut self, channel: Channel) -> Result<ChannelUnit, LinkError> {
        match self.query(&format!(":{}:UNIT?", channel.scpi_name())) {
            Ok(text) => Ok(ChannelUnit::parse(&text)),
            Err(e @ LinkError::Disconnected { .. }) => Err(e),
            Err(e) => {
                log::warn!(
                    "{} unit could not be read ({}); an AMP channel would be scaled by the probe again",
                    channel,
                    e
                );
                Ok(ChannelUnit::Unknown)
            }
        }
    }

    pub fn refresh_channel(&mut self, channel: Channel) -> Result<ChannelConfig, LinkError> {
        let name = channel.scpi_name();
        let displayed = matches!(
            self.query_or(&format!(":{}:DISP?", name), "0")?.trim(),
            "1" | "ON"
        );
        let scale = self.query_f64(&format!(":{}:SCAL?", name))?;
        let offset = self.query_f64(&format!(":{}:OFFS?", name))?;
        let config = match channel {
            Channel::Analog(_) => ChannelConfig {
                channel,
                displayed,
                unit: self.query_unit(channel)?,
                scale,
                offset,
                coupling: self.query_or(&format!(":{}:COUP?", name), "")?,
                probe_ratio: self.query_or(&format!(":{}:PROB?", name), "1.0")?.parse().unwrap_or(1.0),
            },
            Channel::Math(_) => ChannelConfig {
                channel,
                displayed,
                unit: ChannelUnit::Volt,
                scale,
                offset,
                coupling: String::new(),
                probe_ratio: 1.0,
            },
        };
        log::debug!("{} config: {:?}", channel, config);
        self.link
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, config.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Clone)]
    enum Reply {
        Line(&'static str),
        Block(Vec<u8>),
        Silence,
        Hangup,
    }

    #[derive(Default)]
    struct Wire {
        sent: Vec<String>,
        replies: HashMap<String, VecDeque<Reply>>,
        pending: Option<Reply>,
    }

    /// Fake instrument answering by exact command text; unknown queries stay silent.
    struct FakeScope(Arc<Mutex<Wire>>);

    impl ScpiTransport for FakeScope {
        fn send_line(&mut self, line: &str) -> Result<(), TerminalError> {
            let mut wire = self.0.lock().unwrap();
            wire.sent.push(line.to_string());
            let reply = wire
                .replies
                .get_mut(line)
                .and_then(|q| if q.len() > 1 { q.pop_front() } else { q.front().cloned() });
            wire.pending = reply;
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> Result<String, TerminalError> {
            match self.0.lock().unwrap().pending.take() {
                Some(Reply::Line(l)) => Ok(l.to_string()),
                Some(Reply::Hangup) => Err(TerminalError::ConnectionClosed),
                _ => Err(TerminalError::Timeout { waited: timeout, received: 0 }),
            }
        }

        fn read_block(&mut self, timeout: Duration) -> Result<Vec<u8>, TerminalError> {
            match self.0.lock().unwrap().pending.take() {
                Some(Reply::Block(b)) => Ok(b),
                Some(Reply::Line(l)) => Err(TerminalError::MalformedBlock(l.to_string())),
                Some(Reply::Hangup) => Err(TerminalError::ConnectionClosed),
                _ => Err(TerminalError::Timeout { waited: timeout, received: 0 }),
            }
        }

        fn clear_input(&mut self) -> Result<(), TerminalError> {
            Ok(())
        }
    }

    fn fake_link(policy: LinkPolicy, script: &[(&str, Reply)]) -> (InstrumentLink, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire::default()));
        {
            let mut w = wire.lock().unwrap();
            w.replies
                .insert("*IDN?".into(), VecDeque::from([Reply::Line("RIGOL TECHNOLOGIES,MSO5074,X,00.01")]));
            for (cmd, reply) in script {
                w.replies.entry((*cmd).to_string()).or_default().push_back(reply.clone());
            }
        }
        let shared = wire.clone();
        let link = InstrumentLink::connect(
            Box::new(move || Ok(Box::new(FakeScope(shared.clone())) as Box<dyn ScpiTransport>)),
            policy,
        )
        .unwrap();
        (link, wire)
    }

    fn sent(wire: &Arc<Mutex<Wire>>, text: &str) -> usize {
        wire.lock().unwrap().sent.iter().filter(|s| *s == text).count()
    }

    #[test]
    fn test_template_strips_arguments() {
        assert_eq!(Command::write(":WAV:POIN 1000").template(), ":WAV:POIN");
        assert_eq!(Command::query(":CHAN2:UNIT?").template(), ":CHAN2:UNIT?");
        assert!(matches!(Command::from_console(":wav:data?"), Command::BlockQuery(_)));
        assert!(matches!(Command::from_console("*IDN?"), Command::Query(_)));
        assert!(matches!(Command::from_console(":RUN"), Command::Write(_)));
        assert!(matches!(Command::from_console(":DISP:DATA? ON,0,PNG"), Command::BlockQuery(_)));
        assert!(matches!(Command::from_console(":disp:data?"), Command::BlockQuery(_)));
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("2".parse::<Channel>(), Ok(Channel::Analog(2)));
        assert_eq!("ch3".parse::<Channel>(), Ok(Channel::Analog(3)));
        assert_eq!("MATH1".parse::<Channel>(), Ok(Channel::Math(1)));
        assert!("CH9".parse::<Channel>().is_err());
        assert_eq!(Channel::Math(2).scpi_name(), "MATH2");
    }

    #[test]
    fn test_identity_read_on_connect() {
        let (link, _) = fake_link(LinkPolicy::default(), &[]);
        assert!(link.identity().starts_with("RIGOL"));
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_three_timeouts_blacklist_then_fail_fast() {
        let policy = LinkPolicy {
            attempts_per_call: 1,
            cooldown: Duration::from_millis(200),
            ..LinkPolicy::default()
        };
        let (link, wire) = fake_link(policy, &[(":ACQ:SRAT?", Reply::Silence)]);

        for _ in 0..3 {
            let err = link.execute(Command::query(":ACQ:SRAT?")).unwrap_err();
            assert!(matches!(err, LinkError::Timeout { .. }));
        }
        assert_eq!(link.blacklisted(), vec![":ACQ:SRAT?".to_string()]);

        let err = link.execute(Command::query(":ACQ:SRAT?")).unwrap_err();
        assert!(matches!(err, LinkError::Blacklisted { remaining: Some(_), .. }));
        assert_eq!(sent(&wire, ":ACQ:SRAT?"), 3);

        std::thread::sleep(Duration::from_millis(250));
        wire.lock()
            .unwrap()
            .replies
            .insert(":ACQ:SRAT?".into(), VecDeque::from([Reply::Line("2.5E+09")]));
        let response = link.execute(Command::query(":ACQ:SRAT?")).unwrap();
        assert_eq!(response, Response::Text("2.5E+09".into()));
        assert_eq!(sent(&wire, ":ACQ:SRAT?"), 4);
        assert!(link.blacklisted().is_empty());
    }

    #[test]
    fn test_single_call_retries_up_to_threshold() {
        let (link, wire) = fake_link(LinkPolicy::default(), &[(":TRIG:STAT?", Reply::Silence)]);
        let err = link.execute(Command::query(":TRIG:STAT?")).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { attempts: 3, .. }));
        assert_eq!(sent(&wire, ":TRIG:STAT?"), 3);
        assert!(matches!(
            link.execute(Command::query(":TRIG:STAT?")),
            Err(LinkError::Blacklisted { .. })
        ));
    }

    #[test]
    fn test_known_bad_never_reaches_wire() {
        let (link, wire) = fake_link(LinkPolicy::default(), &[]);
        let err = link.execute(Command::query(":MATH1:PROB?")).unwrap_err();
        assert!(matches!(err, LinkError::Blacklisted { remaining: None, .. }));
        assert_eq!(sent(&wire, ":MATH1:PROB?"), 0);
    }

    #[test]
    fn test_garbled_block_is_soft_failure() {
        let (link, _) = fake_link(LinkPolicy::default(), &[(":WAV:DATA?", Reply::Line("garbage"))]);
        for _ in 0..5 {
            let err = link.execute(Command::block_query(":WAV:DATA?")).unwrap_err();
            assert!(matches!(err, LinkError::InvalidResponse { .. }));
        }
        assert!(link.blacklisted().is_empty());
    }

    #[test]
    fn test_disconnect_fails_fast_until_reconnect() {
        let (link, wire) = fake_link(LinkPolicy::default(), &[(":TIM:SCAL?", Reply::Hangup)]);
        assert!(matches!(
            link.execute(Command::query(":TIM:SCAL?")),
            Err(LinkError::Disconnected { .. })
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(matches!(link.execute(Command::query("*IDN?")), Err(LinkError::Disconnected { .. })));
        let idn_before = sent(&wire, "*IDN?");
        assert_eq!(idn_before, 1);

        link.reconnect().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(sent(&wire, "*IDN?"), 2);
    }

    #[test]
    fn test_try_execute_reports_busy() {
        let (link, _) = fake_link(LinkPolicy::default(), &[]);
        let _held = link.exclusive().unwrap();
        assert!(matches!(link.try_execute(Command::query("*IDN?")), Err(LinkError::Busy)));
    }

    #[test]
    fn test_refresh_channel_table() {
        let (link, _) = fake_link(
            LinkPolicy::default(),
            &[
                (":CHAN2:DISP?", Reply::Line("1")),
                (":CHAN2:SCAL?", Reply::Line("5.000000E-02")),
                (":CHAN2:OFFS?", Reply::Line("0.000000E+00")),
                (":CHAN2:UNIT?", Reply::Line("AMP")),
                (":CHAN2:COUP?", Reply::Line("DC")),
                (":CHAN2:PROB?", Reply::Line("10")),
            ],
        );
        assert!(link.channel_config(Channel::Analog(2)).is_none());
        let cfg = link.refresh_channel(Channel::Analog(2)).unwrap();
        assert_eq!(cfg.unit, ChannelUnit::Amp);
        assert!((cfg.scale - 0.05).abs() < 1e-12);
        assert!((cfg.probe_ratio - 10.0).abs() < 1e-12);
        assert_eq!(link.channel_config(Channel::Analog(2)), Some(cfg));
    }

    #[test]
    fn test_unreadable_unit_is_unknown() {
        let (link, wire) = fake_link(
            LinkPolicy::default(),
            &[
                (":CHAN2:DISP?", Reply::Line("1")),
                (":CHAN2:SCAL?", Reply::Line("1.0")),
                (":CHAN2:OFFS?", Reply::Line("0.0")),
                (":CHAN2:UNIT?", Reply::Silence),
                (":CHAN2:COUP?", Reply::Line("AC")),
                (":CHAN2:PROB?", Reply::Line("1")),
            ],
        );
        let cfg = link.refresh_channel(Channel::Analog(2)).unwrap();
        assert_eq!(cfg.unit, ChannelUnit::Unknown);
        assert_eq!(sent(&wire, ":CHAN2:UNIT?"), 3);

        // Once blacklisted the unit still resolves to Unknown, never Volt.
        let cfg = link.refresh_channel(Channel::Analog(2)).unwrap();
        assert_eq!(cfg.unit, ChannelUnit::Unknown);
        assert_eq!(sent(&wire, ":CHAN2:UNIT?"), 3);
    }
}
