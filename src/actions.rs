use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn, Level};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use ircontrol_shared::IrCode;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// The send path actions may re-enter.
pub trait Transmitter: Send + Sync {
    fn send_by_name(&self, name: &str);
    fn send_by_code(&self, code: &IrCode);
}

/// User supplied behaviour for [`Action::Custom`].
///
/// Runs on the caller's thread, so it should return quickly.
pub trait ActionHandler: Send + Sync {
    fn call(&self, tx: &dyn Transmitter, name: &str);
}

#[derive(Clone)]
pub struct CustomAction(pub Arc<dyn ActionHandler>);

impl fmt::Debug for CustomAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomAction")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitTarget {
    Name(String),
    Code(#[serde(with = "crate::config::code_line")] IrCode),
}

fn default_level() -> Level {
    Level::Info
}

/// What to do when a name is triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// Without `args` the command line goes through the shell.
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
    },
    /// HTTP GET with `params` as the query string.
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, String>,
    },
    Emit {
        #[serde(flatten)]
        target: EmitTarget,
    },
    Log {
        message: String,
        #[serde(default = "default_level")]
        level: Level,
    },
    /// Run the most recently executed action again.
    Repeat,
    #[serde(skip)]
    Custom(CustomAction),
}

impl Action {
    pub fn custom<H: ActionHandler + 'static>(handler: H) -> Action {
        Action::Custom(CustomAction(Arc::new(handler)))
    }

    fn kind(&self) -> &'static str {
        match self {
            Action::Shell { .. } => "shell",
            Action::Webhook { .. } => "webhook",
            Action::Emit { .. } => "emit",
            Action::Log { .. } => "log",
            Action::Repeat => "repeat",
            Action::Custom(_) => "custom",
        }
    }
}

/// Runs shell and webhook actions off the caller's thread.
///
/// At most `max_concurrent` of them are in flight at once, the rest queue for a permit.
#[derive(Clone)]
pub struct Executor {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    http: reqwest::Client,
}

impl Executor {
    pub fn new(max_concurrent: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;

        Ok(Executor {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            http,
        })
    }

    fn spawn<F>(&self, what: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No runtime available, dropping {} action", what);
                return;
            }
        };

        let permits = self.permits.clone();
        self.tracker.spawn_on(
            async move {
                let _permit = permits.acquire_owned().await;
                task.await
            },
            &handle,
        );
    }

    /// Stop accepting work and wait up to `grace` for running actions.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            info!("Leaving {} actions running", self.tracker.len());
        }
    }
}

async fn run_shell(command: String, args: Vec<String>) {
    let mut cmd = if args.is_empty() {
        shell_command(&command)
    } else {
        let mut cmd = Command::new(&command);
        cmd.args(&args);
        cmd
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Error: could not run `{}`: {}", command, e);
            return;
        }
    };

    match child.wait().await {
        Ok(status) if !status.success() => warn!("`{}` exited with {}", command, status),
        Ok(_) => debug!("`{}` finished", command),
        Err(e) => warn!("Error: waiting for `{}`: {}", command, e),
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

async fn run_webhook(http: reqwest::Client, url: String, params: BTreeMap<String, String>) {
    match http.get(&url).query(&params).send().await {
        Ok(resp) if !resp.status().is_success() => {
            warn!("GET {} returned {}", url, resp.status())
        }
        Ok(_) => debug!("GET {} done", url),
        Err(e) => warn!("Error: GET {} failed: {}", url, e),
    }
}

/// Name to action mapping.
///
/// Filled once at startup; single entries may be rebound later, and the last executed
/// action is remembered for [`Action::Repeat`].
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Action>>,
    last: Mutex<Option<(String, Action)>>,
    executor: Executor,
}

impl ActionRegistry {
    pub fn new(executor: Executor) -> Self {
        ActionRegistry {
            actions: RwLock::new(HashMap::new()),
            last: Mutex::new(None),
            executor,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, action: Action) {
        self.actions.get_mut().insert(name.into(), action);
    }

    /// Replace a single entry while the registry is in use.
    pub fn rebind(&self, name: impl Into<String>, action: Action) -> Option<Action> {
        self.actions.write().insert(name.into(), action)
    }

    pub fn lookup(&self, name: &str) -> Option<Action> {
        self.actions.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }

    /// Serializable view of the registry. Custom actions are left out.
    pub fn snapshot(&self) -> BTreeMap<String, Action> {
        self.actions
            .read()
            .iter()
            .filter(|(_, action)| !matches!(action, Action::Custom(_)))
            .map(|(name, action)| (name.clone(), action.clone()))
            .collect()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run the action bound to `name`, returns false when there is none.
    pub fn trigger(&self, name: &str, tx: &dyn Transmitter) -> bool {
        match self.lookup(name) {
            Some(action) => {
                self.execute(name, &action, tx);
                true
            }
            None => false,
        }
    }

    /// Run `action` on behalf of `name`. Failures are logged, never returned.
    pub fn execute(&self, name: &str, action: &Action, tx: &dyn Transmitter) {
        if let Action::Repeat = action {
            let last = self.last.lock().clone();
            match last {
                Some((last_name, last_action)) => {
                    info!("Repeating {} for {}", last_name, name);
                    self.run(&last_name, &last_action, tx);
                }
                None => info!("Nothing to repeat for {}", name),
            }
            return;
        }

        *self.last.lock() = Some((name.to_string(), action.clone()));
        self.run(name, action, tx);
    }

    fn run(&self, name: &str, action: &Action, tx: &dyn Transmitter) {
        info!("Action {} for {}", action.kind(), name);

        match action {
            Action::Shell { command, args } => {
                let task = run_shell(command.clone(), args.clone());
                self.executor.spawn("shell", task);
            }
            Action::Webhook { url, params } => {
                let task = run_webhook(self.executor.http.clone(), url.clone(), params.clone());
                self.executor.spawn("webhook", task);
            }
            Action::Emit { target } => match target {
                EmitTarget::Name(target) => tx.send_by_name(target),
                EmitTarget::Code(code) => tx.send_by_code(code),
            },
            Action::Log { message, level } => log::log!(*level, "{}", message),
            Action::Repeat => {}
            Action::Custom(CustomAction(handler)) => {
                let call = AssertUnwindSafe(|| handler.call(tx, name));
                if panic::catch_unwind(call).is_err() {
                    warn!("Custom action for {} panicked", name);
                }
            }
        }
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &*self.actions.read())
            .finish()
    }
}
