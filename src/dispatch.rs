use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ircontrol_shared::{Interface, IrCode, Message};

use crate::actions::Transmitter;
use crate::config::Config;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Longest stretch a pause sleeps before looking at the cancellation token again.
const CANCEL_CHECK: Duration = Duration::from_millis(20);

/// Connects received codes to actions, and names to transmitted codes.
///
/// Every call into the serial interface blocks, so [`Dispatcher::run`] wants a thread of
/// its own and async callers go through `spawn_blocking` to send.
pub struct Dispatcher<I> {
    interface: Mutex<I>,
    config: Arc<Config>,
    port: String,
    baudrate: u32,
    reconnect_delay: Duration,
    poll_interval: Duration,
}

impl<I: Interface + Send> Dispatcher<I> {
    pub fn new(interface: I, config: Arc<Config>, port: impl Into<String>, baudrate: u32) -> Self {
        Dispatcher {
            interface: Mutex::new(interface),
            config,
            port: port.into(),
            baudrate,
            reconnect_delay: RECONNECT_DELAY,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_delays(mut self, reconnect_delay: Duration, poll_interval: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self.poll_interval = poll_interval;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Keep the serial link up and handle everything it receives, until cancelled.
    pub fn run(&self, token: &CancellationToken) {
        info!("Dispatching on {} at {} baud", self.port, self.baudrate);

        while !token.is_cancelled() {
            if !self.interface.lock().is_connected() {
                let connected = self.interface.lock().connect(&self.port, self.baudrate);
                if let Err(e) = connected {
                    error!("No serial port {}: {}", self.port, e);
                    if !pause(token, self.reconnect_delay) {
                        break;
                    }
                }
                continue;
            }

            let msg = self.interface.lock().get_message();
            match msg {
                Some(msg) => self.handle(&msg),
                None => {
                    if !pause(token, self.poll_interval) {
                        break;
                    }
                }
            }
        }

        info!("Dispatch loop stopped");
    }

    /// Act on one inbound message. Only received IR codes are of interest here.
    pub fn handle(&self, msg: &Message) {
        match msg {
            Message::IrReceived(spec) => match IrCode::try_from(*spec) {
                Ok(code) => self.ir_received(&code),
                Err(e) => warn!("Dropping {}: {}", msg, e),
            },
            other => debug!("Ignoring {}", other),
        }
    }

    fn ir_received(&self, code: &IrCode) {
        let name = match self.config.codes.lookup_name_for_code(code) {
            Some(name) => name,
            None => {
                debug!("IR code not known: {}", code);
                return;
            }
        };

        debug!("IR name known: {}", name);
        if !self.config.actions.trigger(name, self) {
            debug!("No action for {}", name);
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
fn pause(token: &CancellationToken, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK));
    }
}

impl<I: Interface + Send> Transmitter for Dispatcher<I> {
    fn send_by_name(&self, name: &str) {
        match self.config.codes.lookup_code_for_name(name) {
            Some(code) => self.send_by_code(&code),
            None => warn!("Tried to send unknown {} ir code", name),
        }
    }

    fn send_by_code(&self, code: &IrCode) {
        debug!("Sending ir {}", code);

        let msg = match Message::ir_send(code) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Conversion failed: {}", e);
                return;
            }
        };

        if let Err(e) = self.interface.lock().put_message(&msg) {
            error!("Sending {} failed: {}", code, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionRegistry, EmitTarget, Executor};
    use crate::testutil::{capture_logs, captured_logs, MockLink};
    use ircontrol_shared::codetable::load_from_text;
    use ircontrol_shared::protocol::{IrSpecification, StatusPayload};
    use ircontrol_shared::{CodeTable, Protocol};
    use log::Level;

    const CODES: &str = "\
@preset samsung_tv_
SAMSUNG 32 0xE0E040BF standby
SAMSUNG 32 0xE0E0E01F volup
";

    fn config() -> Arc<Config> {
        let mut codes = CodeTable::new();
        codes.merge(load_from_text(CODES, None).entries);
        codes.merge(load_from_text("SONY 12 0x481 amp_volup\nUNKNOWN 0 0x0 placeholder", None).entries);

        let mut actions = ActionRegistry::new(Executor::new(2).unwrap());
        actions.register(
            "samsung_tv_volup",
            Action::Emit {
                target: EmitTarget::Name("amp_volup".into()),
            },
        );
        actions.register(
            "samsung_tv_standby",
            Action::Emit {
                target: EmitTarget::Name("nonexistent".into()),
            },
        );

        Arc::new(Config::new(codes, actions))
    }

    fn dispatcher(link: MockLink) -> Dispatcher<MockLink> {
        Dispatcher::new(link, config(), "/dev/null", 9600)
            .with_delays(Duration::from_millis(5), Duration::from_millis(1))
    }

    fn received(packet: [u8; 16]) -> Message {
        Message::decode(&packet).unwrap()
    }

    #[test]
    fn send_by_name_encodes_code() {
        let link = MockLink::connected();
        let d = dispatcher(link.clone());

        d.send_by_name("samsung_tv_standby");
        let sent = link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].encode(),
            [4, 0, 8, 32, 0xBF, 0x40, 0xE0, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn unknown_name_sends_nothing() {
        let link = MockLink::connected();
        let d = dispatcher(link.clone());

        capture_logs();
        d.send_by_name("nonexistent");
        d.send_by_code(&IrCode::new(Protocol::Unknown, 0, 0));
        assert!(link.sent().is_empty());

        let logs = captured_logs();
        assert!(logs.contains(&(Level::Warn, "Tried to send unknown nonexistent ir code".into())));
        assert!(logs
            .iter()
            .any(|(level, msg)| *level == Level::Error && msg.starts_with("Conversion failed")));
    }

    #[test]
    fn received_code_triggers_action() {
        let link = MockLink::connected();
        let d = dispatcher(link.clone());

        let volup = Message::IrReceived(IrCode::new(Protocol::Samsung, 32, 0xE0E0E01F).into());
        d.handle(&volup);

        assert_eq!(
            link.sent(),
            vec![Message::IrSend(IrCode::new(Protocol::Sony, 12, 0x481).into())]
        );
    }

    #[test]
    fn received_packet_resolves_name() {
        let d = dispatcher(MockLink::connected());
        let msg = received([
            0x05, 0x00, 0x08, 0x20, 0xBF, 0x40, 0xE0, 0xE0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ]);

        let code = match msg {
            Message::IrReceived(spec) => IrCode::try_from(spec).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            d.config().codes.lookup_name_for_code(&code),
            Some("samsung_tv_standby")
        );
    }

    #[test]
    fn unmapped_and_other_messages_do_nothing() {
        let link = MockLink::connected();
        let d = dispatcher(link.clone());

        d.handle(&Message::IrReceived(IrCode::new(Protocol::Nec, 32, 0x1234).into()));
        d.handle(&Message::IrReceived(IrSpecification {
            protocol: 99,
            bits: 32,
            value: 1,
        }));
        d.handle(&Message::GetStatus(StatusPayload { uptime: 10 }));
        d.handle(&Message::IrSend(IrCode::new(Protocol::Samsung, 32, 0xE0E0E01F).into()));

        assert!(link.sent().is_empty());
    }

    #[test]
    fn unmapped_code_is_logged_at_debug() {
        let link = MockLink::connected();
        let d = dispatcher(link.clone());

        capture_logs();
        let code = IrCode::new(Protocol::Nec, 32, 0x1234);
        d.handle(&Message::IrReceived(code.into()));

        assert!(link.sent().is_empty());
        assert!(captured_logs().contains(&(Level::Debug, format!("IR code not known: {}", code))));
        assert!(!captured_logs().iter().any(|(_, msg)| msg.starts_with("Action ")));
    }

    fn spawn_run(d: &Arc<Dispatcher<MockLink>>, token: &CancellationToken) -> thread::JoinHandle<()> {
        let d = d.clone();
        let token = token.clone();
        thread::spawn(move || d.run(&token))
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn loop_reconnects_and_handles_in_order() {
        let link = MockLink::failing_connects(2);
        link.push_inbound(Message::IrReceived(
            IrCode::new(Protocol::Samsung, 32, 0xE0E0E01F).into(),
        ));
        link.push_inbound(Message::GetStatus(StatusPayload { uptime: 1 }));
        link.push_inbound(Message::IrReceived(
            IrCode::new(Protocol::Samsung, 32, 0xE0E0E01F).into(),
        ));

        let d = Arc::new(dispatcher(link.clone()));
        let token = CancellationToken::new();
        let runner = spawn_run(&d, &token);

        wait_for(|| link.sent().len() >= 2);
        token.cancel();
        runner.join().unwrap();

        assert_eq!(link.connect_attempts(), 3);
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn loop_reconnects_after_link_loss() {
        let link = MockLink::connected();
        link.drop_connection();

        let d = Arc::new(dispatcher(link.clone()));
        let token = CancellationToken::new();
        let runner = spawn_run(&d, &token);

        wait_for(|| link.connect_attempts() > 0);
        token.cancel();
        runner.join().unwrap();

        assert_eq!(link.connect_attempts(), 1);
    }

    #[test]
    fn cancellation_stops_reconnect_wait() {
        let link = MockLink::failing_connects(usize::MAX);
        let d = Arc::new(
            Dispatcher::new(link.clone(), config(), "/dev/null", 9600)
                .with_delays(Duration::from_secs(3600), Duration::from_millis(1)),
        );

        let token = CancellationToken::new();
        let started = Instant::now();
        let runner = spawn_run(&d, &token);

        wait_for(|| link.connect_attempts() > 0);
        token.cancel();
        runner.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(link.connect_attempts(), 1);
    }

    #[test]
    fn send_path_runs_beside_the_loop() {
        let link = MockLink::connected();
        let d = Arc::new(dispatcher(link.clone()));
        let token = CancellationToken::new();
        let runner = spawn_run(&d, &token);

        let senders: Vec<_> = (0..4)
            .map(|_| {
                let d = d.clone();
                thread::spawn(move || d.send_by_name("samsung_tv_volup"))
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        token.cancel();
        runner.join().unwrap();
        assert_eq!(link.sent().len(), 4);
    }
}
