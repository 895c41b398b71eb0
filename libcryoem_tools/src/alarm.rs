//! Watch a data-collection folder and send e-mails when new movies stop arriving.
use human_bytes::human_bytes;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;
use walkdir::WalkDir;

use super::config::{require_positive, YamlConfig};
use super::error::{ConfigError, MonitorError, NotifyError};

pub const MIN_CHECK_MINUTES: f64 = 5.0;
const BYTES_PER_TB: f64 = 1.0e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Implicit TLS, usually port 465
    #[default]
    Ssl,
    /// STARTTLS upgrade, usually port 587
    Starttls,
    /// Unauthenticated plain relay, typically the local MTA (`smtp_server: localhost`,
    /// `port: 25`)
    Localhost,
}

/// What to do once the folder stops growing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Send one Error e-mail per stall and keep watching
    #[default]
    Continue,
    /// Send a Stop e-mail and end the monitor
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub sender: String,
    pub password: String,
    pub recipients: Vec<String>,
    pub smtp_server: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub path: PathBuf,
    pub label: String,
    pub check_interval_minutes: f64,
    /// Send an OK e-mail at most this often while files keep arriving
    pub ok_report_minutes: Option<f64>,
    pub start_delay_seconds: f64,
    pub lifetime_days: f64,
    pub error_wait_minutes: f64,
    pub stall_policy: StallPolicy,
    pub progress_log: PathBuf,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            sender: String::new(),
            password: String::new(),
            recipients: vec![],
            smtp_server: String::from("smtp.mail.yahoo.com"),
            port: 465,
            security: SmtpSecurity::Ssl,
            path: PathBuf::from("./"),
            label: String::from(".tiff"),
            check_interval_minutes: 10.0,
            ok_report_minutes: Some(90.0),
            start_delay_seconds: 300.0,
            lifetime_days: 3.0,
            error_wait_minutes: 5.0,
            stall_policy: StallPolicy::Continue,
            progress_log: PathBuf::from("data_collection_progress.log"),
        }
    }
}

impl YamlConfig for AlarmConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_minutes < MIN_CHECK_MINUTES {
            return Err(ConfigError::InvalidValue {
                field: "check_interval_minutes",
                reason: format!(
                    "checks must be at least {MIN_CHECK_MINUTES} minutes apart, got {}",
                    self.check_interval_minutes
                ),
            });
        }
        if self.recipients.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "recipients",
                reason: String::from("at least one address is needed"),
            });
        }
        if self.sender.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "sender",
                reason: String::from("a sending address is needed"),
            });
        }
        require_positive("lifetime_days", self.lifetime_days)?;
        require_positive("error_wait_minutes", self.error_wait_minutes)?;
        if self.start_delay_seconds < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "start_delay_seconds",
                reason: String::from("cannot be negative"),
            });
        }
        Ok(())
    }
}

impl AlarmConfig {
    fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_minutes * 60.0)
    }

    fn error_wait(&self) -> Duration {
        Duration::from_secs_f64(self.error_wait_minutes * 60.0)
    }

    fn lifetime(&self) -> Duration {
        Duration::from_secs_f64(self.lifetime_days * 24.0 * 3600.0)
    }
}

/// Matching files below a folder and their total size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderSize {
    pub files: usize,
    pub bytes: u64,
}

impl FolderSize {
    pub fn terabytes(&self) -> f64 {
        self.bytes as f64 / BYTES_PER_TB
    }
}

/// Count the files below `path` (recursively) whose names end with `label` and sum
/// their sizes
pub fn folder_size(path: &Path, label: &str) -> Result<FolderSize, std::io::Error> {
    let mut size = FolderSize::default();
    for entry in WalkDir::new(path).min_depth(1).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().ends_with(label) {
            size.files += 1;
            size.bytes += entry.metadata()?.len();
        }
    }
    Ok(size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmMessage {
    Start,
    Error,
    Ok,
    Stop,
    Finish,
}

/// Everything an e-mail reports
#[derive(Debug, Clone)]
pub struct MessageContext<'a> {
    pub sent_at: &'a str,
    pub folder: &'a Path,
    pub size: FolderSize,
    pub interval_minutes: f64,
    pub hours_left: f64,
    pub lifetime_days: f64,
}

impl AlarmMessage {
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Start => "STARTED data collection monitor [do not reply please]",
            Self::Error => "ERROR in data collection [do not reply please]",
            Self::Ok => "OK data collection [do not reply please]",
            Self::Stop => "ERROR in data collection FINAL email [do not reply please]",
            Self::Finish => "STOP data collection monitor FINAL email [do not reply please]",
        }
    }

    pub fn body(&self, context: &MessageContext) -> String {
        let sent_at = context.sent_at;
        let interval = context.interval_minutes;
        let hours_left = context.hours_left;
        let event = match self {
            Self::Start => format!(
                "START of the data collection monitor on {sent_at}.\n\n\
                 If no new files appear within {interval:.0} minutes you will be notified by \
                 another e-mail. The monitor ends in {hours_left:.2} hours."
            ),
            Self::Error => format!(
                "POTENTIAL ERROR IN THE DATA COLLECTION on {sent_at}.\n\n\
                 No new files were registered in the last {interval:.0} minutes. You will hear \
                 again only once the data collection resumes. The monitor ends in \
                 {hours_left:.2} hours."
            ),
            Self::Ok => format!(
                "PROGRESS in the data collection on {sent_at}.\n\n\
                 If no new files appear within {interval:.0} minutes you will be notified by \
                 another e-mail. The monitor ends in {hours_left:.2} hours."
            ),
            Self::Stop => format!(
                "POTENTIAL ERROR IN THE DATA COLLECTION on {sent_at}.\n\n\
                 No new files were registered in the last {interval:.0} minutes. The monitor \
                 stops now. Use the continue stall policy to keep watching after a stall."
            ),
            Self::Finish => format!(
                "END of the data collection monitor on {sent_at}.\n\n\
                 The monitor ran for its full lifetime of {} day(s). Start it again to keep \
                 watching.",
                context.lifetime_days
            ),
        };
        format!(
            "This automatic e-mail informs you about the {event}\n\n\
             Folder: {}\n\
             Total size of the matching files: {:.4} TB ({})\n\
             Number of matching files: {}\n\n\
             -- \ncryoem_tools {}\n",
            context.folder.display(),
            context.size.terabytes(),
            human_bytes(context.size.bytes as f64),
            context.size.files,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

/// Delivers a message to everyone interested
pub trait Notifier {
    fn notify(&mut self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// E-mail over SMTP, one message per recipient
pub struct SmtpNotifier {
    transport: SmtpTransport,
    server: String,
    port: u16,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(config: &AlarmConfig) -> Result<Self, NotifyError> {
        let from: Mailbox = config.sender.parse()?;
        let recipients = config
            .recipients
            .iter()
            .map(|address| address.parse::<Mailbox>())
            .collect::<Result<Vec<Mailbox>, _>>()?;
        let credentials = Credentials::new(config.sender.clone(), config.password.clone());
        let transport = match config.security {
            SmtpSecurity::Ssl => SmtpTransport::relay(&config.smtp_server)?
                .port(config.port)
                .credentials(credentials)
                .build(),
            SmtpSecurity::Starttls => SmtpTransport::starttls_relay(&config.smtp_server)?
                .port(config.port)
                .credentials(credentials)
                .build(),
            SmtpSecurity::Localhost => SmtpTransport::builder_dangerous(&config.smtp_server)
                .port(config.port)
                .build(),
        };
        log::info!(
            "Mail goes through {}:{} ({:?})",
            config.smtp_server,
            config.port,
            config.security
        );
        Ok(Self {
            transport,
            server: config.smtp_server.clone(),
            port: config.port,
            from,
            recipients,
        })
    }

    /// Server and port the transport talks to
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.server, self.port)
    }
}

impl Notifier for SmtpNotifier {
    /// Every recipient is tried. The first failure is returned after the rest were sent.
    fn notify(&mut self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let mut first_error = None;
        for recipient in self.recipients.iter() {
            let result = Message::builder()
                .from(self.from.clone())
                .to(recipient.clone())
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .map_err(NotifyError::from)
                .and_then(|email| {
                    self.transport
                        .send(&email)
                        .map(|_| ())
                        .map_err(NotifyError::from)
                });
            match result {
                Ok(()) => log::info!("E-mail to {recipient} sent: {subject}"),
                Err(e) => {
                    log::error!("E-mail to {recipient} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Time source of the monitor
pub trait Clock {
    /// Time since the monitor started
    fn elapsed(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
    /// Wall clock time for logs and e-mails
    fn timestamp(&self) -> String;
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn timestamp(&self) -> String {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        now.format(format_description!(
            "[day]/[month]/[year] [hour]:[minute]:[second]"
        ))
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
    }
}

/// Where folder sizes come from
pub trait Probe {
    fn measure(&mut self) -> Result<FolderSize, std::io::Error>;
}

pub struct FolderProbe {
    path: PathBuf,
    label: String,
}

impl FolderProbe {
    pub fn new(path: &Path, label: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            label: label.to_string(),
        }
    }
}

impl Probe for FolderProbe {
    fn measure(&mut self) -> Result<FolderSize, std::io::Error> {
        folder_size(&self.path, &self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Ran for the configured lifetime
    Finished,
    /// Ended on the first stall under [StallPolicy::Stop]
    Stalled,
}

pub struct Monitor<N: Notifier, C: Clock, P: Probe> {
    config: AlarmConfig,
    folder: PathBuf,
    notifier: N,
    clock: C,
    probe: P,
}

impl<N: Notifier, C: Clock, P: Probe> Monitor<N, C, P> {
    pub fn new(config: AlarmConfig, notifier: N, clock: C, probe: P) -> Self {
        let folder = std::fs::canonicalize(&config.path).unwrap_or_else(|_| config.path.clone());
        Self {
            config,
            folder,
            notifier,
            clock,
            probe,
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    fn hours_left(&self) -> f64 {
        let left = self.config.lifetime().saturating_sub(self.clock.elapsed());
        left.as_secs_f64() / 3600.0
    }

    /// Append `<date time> <files> <TB>` to the progress log
    fn record(&self, stamp: &str, status: &str, size: FolderSize) -> Result<(), MonitorError> {
        log::info!(
            "{status}: {} file(s), {} ({:.6} TB)",
            size.files,
            human_bytes(size.bytes as f64),
            size.terabytes()
        );
        let mut log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.progress_log)?;
        writeln!(log_file, "{stamp} {} {:.6}", size.files, size.terabytes())?;
        Ok(())
    }

    /// Send an e-mail. Delivery failures are logged and do not end the monitor.
    fn send(&mut self, message: AlarmMessage, size: FolderSize, interval: Duration) -> String {
        let stamp = self.clock.timestamp();
        let context = MessageContext {
            sent_at: &stamp,
            folder: &self.folder,
            size,
            interval_minutes: interval.as_secs_f64() / 60.0,
            hours_left: self.hours_left(),
            lifetime_days: self.config.lifetime_days,
        };
        let body = message.body(&context);
        if let Err(e) = self.notifier.notify(message.subject(), &body) {
            log::warn!("Could not deliver {message:?} e-mail, monitoring continues: {e}");
        }
        stamp
    }

    pub fn run(&mut self) -> Result<MonitorOutcome, MonitorError> {
        let interval = self.config.check_interval();
        let error_wait = self.config.error_wait();
        let lifetime = self.config.lifetime();
        let ok_report = self
            .config
            .ok_report_minutes
            .map(|minutes| Duration::from_secs_f64(minutes * 60.0));

        let mut last = self.probe.measure()?;
        let stamp = self.send(AlarmMessage::Start, last, interval);
        self.record(&stamp, "START", last)?;
        let mut last_report = self.clock.elapsed();

        log::info!(
            "Waiting {} seconds before the first check of {}",
            self.config.start_delay_seconds,
            self.folder.display()
        );
        self.clock
            .sleep(Duration::from_secs_f64(self.config.start_delay_seconds));

        let mut stalled = false;
        while self.clock.elapsed() < lifetime {
            let current = self.probe.measure()?;
            if current.files != last.files {
                last = current;
                stalled = false;
                self.record(&self.clock.timestamp(), "OK", current)?;
                if let Some(every) = ok_report {
                    if self.clock.elapsed().saturating_sub(last_report) >= every {
                        self.send(AlarmMessage::Ok, current, interval);
                        last_report = self.clock.elapsed();
                    }
                }
                self.clock.sleep(interval);
                continue;
            }

            if !stalled {
                stalled = true;
                self.record(&self.clock.timestamp(), "ERROR", current)?;
                match self.config.stall_policy {
                    StallPolicy::Continue => {
                        self.send(AlarmMessage::Error, current, interval);
                        last_report = self.clock.elapsed();
                    }
                    StallPolicy::Stop => {
                        self.send(AlarmMessage::Stop, current, interval);
                        log::error!(
                            "No new files in {} for {:.1} minutes, monitor stopped",
                            self.folder.display(),
                            interval.as_secs_f64() / 60.0
                        );
                        return Ok(MonitorOutcome::Stalled);
                    }
                }
            }
            self.clock.sleep(error_wait);
        }

        log::warn!(
            "Monitor ran to completion after {} day(s)",
            self.config.lifetime_days
        );
        let stamp = self.send(AlarmMessage::Finish, last, interval);
        self.record(&stamp, "FINISH", last)?;
        Ok(MonitorOutcome::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClock {
        now: Duration,
    }

    impl Clock for FakeClock {
        fn elapsed(&self) -> Duration {
            self.now
        }

        fn sleep(&mut self, duration: Duration) {
            self.now += duration;
        }

        fn timestamp(&self) -> String {
            format!("t+{}s", self.now.as_secs())
        }
    }

    /// Plays back the given file counts, then keeps growing by one file per check
    struct ScriptedProbe {
        counts: Vec<usize>,
        calls: usize,
    }

    impl Probe for ScriptedProbe {
        fn measure(&mut self) -> Result<FolderSize, std::io::Error> {
            let files = match self.counts.get(self.calls) {
                Some(files) => *files,
                None => self.counts.last().copied().unwrap_or(0) + self.calls,
            };
            self.calls += 1;
            Ok(FolderSize {
                files,
                bytes: files as u64 * 1000,
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        subjects: Vec<String>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&mut self, subject: &str, _body: &str) -> Result<(), NotifyError> {
            self.subjects.push(subject.to_string());
            if self.fail {
                Err(NotifyError::Address(
                    "not an address".parse::<Mailbox>().unwrap_err(),
                ))
            } else {
                Ok(())
            }
        }
    }

    fn config(dir: &Path, policy: StallPolicy) -> AlarmConfig {
        AlarmConfig {
            sender: String::from("scope@example.org"),
            recipients: vec![String::from("me@example.org")],
            path: dir.to_path_buf(),
            check_interval_minutes: 5.0,
            ok_report_minutes: None,
            start_delay_seconds: 0.0,
            lifetime_days: 1.0 / 24.0,
            error_wait_minutes: 5.0,
            stall_policy: policy,
            progress_log: dir.join("progress.log"),
            ..Default::default()
        }
    }

    fn monitor(
        dir: &Path,
        policy: StallPolicy,
        counts: Vec<usize>,
        notifier: RecordingNotifier,
    ) -> Monitor<RecordingNotifier, FakeClock, ScriptedProbe> {
        Monitor::new(
            config(dir, policy),
            notifier,
            FakeClock {
                now: Duration::ZERO,
            },
            ScriptedProbe { counts, calls: 0 },
        )
    }

    fn subjects(monitor: &Monitor<RecordingNotifier, FakeClock, ScriptedProbe>) -> Vec<AlarmMessage> {
        let all = [
            AlarmMessage::Start,
            AlarmMessage::Error,
            AlarmMessage::Ok,
            AlarmMessage::Stop,
            AlarmMessage::Finish,
        ];
        monitor
            .notifier()
            .subjects
            .iter()
            .filter_map(|subject| all.iter().find(|m| m.subject() == subject).copied())
            .collect()
    }

    #[test]
    fn steady_growth_runs_to_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(dir.path(), StallPolicy::Stop, vec![], Default::default());
        assert_eq!(monitor.run().unwrap(), MonitorOutcome::Finished);
        assert_eq!(
            subjects(&monitor),
            vec![AlarmMessage::Start, AlarmMessage::Finish]
        );
        let log = std::fs::read_to_string(dir.path().join("progress.log")).unwrap();
        // start, twelve checks, finish
        assert_eq!(log.lines().count(), 14);
        assert!(log.lines().next().unwrap().starts_with("t+0s 0 "));
    }

    #[test]
    fn stop_policy_ends_on_first_stall() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(dir.path(), StallPolicy::Stop, vec![3, 4, 4], Default::default());
        assert_eq!(monitor.run().unwrap(), MonitorOutcome::Stalled);
        assert_eq!(
            subjects(&monitor),
            vec![AlarmMessage::Start, AlarmMessage::Stop]
        );
    }

    #[test]
    fn continue_policy_mails_once_per_stall() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(
            dir.path(),
            StallPolicy::Continue,
            vec![1, 2, 2, 2, 3],
            Default::default(),
        );
        assert_eq!(monitor.run().unwrap(), MonitorOutcome::Finished);
        assert_eq!(
            subjects(&monitor),
            vec![
                AlarmMessage::Start,
                AlarmMessage::Error,
                AlarmMessage::Finish
            ]
        );
    }

    #[test]
    fn ok_reports_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), StallPolicy::Continue);
        config.ok_report_minutes = Some(20.0);
        let mut monitor = Monitor::new(
            config,
            RecordingNotifier::default(),
            FakeClock {
                now: Duration::ZERO,
            },
            ScriptedProbe {
                counts: vec![],
                calls: 0,
            },
        );
        monitor.run().unwrap();
        let oks = subjects(&monitor)
            .into_iter()
            .filter(|m| *m == AlarmMessage::Ok)
            .count();
        // checks at 0, 5, ..., 55 minutes, a report allowed every 20
        assert_eq!(oks, 2);
    }

    #[test]
    fn failed_delivery_does_not_stop_monitoring() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let mut monitor = monitor(dir.path(), StallPolicy::Continue, vec![], notifier);
        assert_eq!(monitor.run().unwrap(), MonitorOutcome::Finished);
        assert_eq!(monitor.notifier().subjects.len(), 2);
    }

    #[test]
    fn folder_size_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("grid1")).unwrap();
        std::fs::write(dir.path().join("a.tiff"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("grid1").join("b.tiff"), [0u8; 5]).unwrap();
        std::fs::write(dir.path().join("grid1").join("b.xml"), [0u8; 7]).unwrap();
        let size = folder_size(dir.path(), ".tiff").unwrap();
        assert_eq!(size, FolderSize { files: 2, bytes: 15 });
    }

    #[test]
    fn local_relay_uses_configured_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = AlarmConfig {
            security: SmtpSecurity::Localhost,
            smtp_server: String::from("mailrelay.lab"),
            port: 2525,
            ..config(dir.path(), StallPolicy::Continue)
        };
        let notifier = SmtpNotifier::new(&config).unwrap();
        assert_eq!(notifier.endpoint(), ("mailrelay.lab", 2525));
    }

    #[test]
    fn short_check_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), StallPolicy::Continue);
        assert!(config.validate().is_ok());
        config.check_interval_minutes = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn message_text() {
        let size = FolderSize {
            files: 12,
            bytes: 2_500_000_000_000,
        };
        let context = MessageContext {
            sent_at: "01/02/2024 10:00:00",
            folder: Path::new("/data/session"),
            size,
            interval_minutes: 10.0,
            hours_left: 71.5,
            lifetime_days: 3.0,
        };
        let body = AlarmMessage::Start.body(&context);
        assert!(body.contains("START of the data collection monitor on 01/02/2024 10:00:00"));
        assert!(body.contains("within 10 minutes"));
        assert!(body.contains("2.5000 TB"));
        assert!(body.contains("Number of matching files: 12"));
    }
}
