//! The auxiliary interpreter hosting user code.
//!
//! Inline source execution is delegated to a long-lived `python3` child
//! process (preferring the workspace venv's interpreter once one exists)
//! that speaks length-prefixed JSON frames over stdin/stdout. The worker
//! never interprets user values itself; arguments and results ride through
//! as opaque blobs.
//!
//! If the child dies, the next request respawns it and bumps the host
//! generation; callers that cache state derived from the child (the
//! instance registry) must discard it when the generation moves.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use color_eyre::{
    Result,
    eyre::{Context as _, ContextCompat as _, bail},
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};
use tracing::{debug, instrument, warn};

use clients::flash::v1::Blob;

use crate::layout::WorkspaceLayout;

const FRAME_HEADER_LEN: usize = 4;

/// Hard cap on a single reply frame; a frame larger than this indicates a
/// corrupted stream, not a legitimate result.
const MAX_FRAME_LEN: u32 = 512 * 1024 * 1024;

static HOST_SCRIPT: &str = include_str!("shim/host.py");

/// A request frame sent to the interpreter.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShimRequest {
    Ping,
    RunFunction {
        function_name: String,
        code: String,
        args: Vec<Blob>,
        kwargs: BTreeMap<String, Blob>,
    },
    RunMethod {
        class_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        method_name: String,
        instance_id: String,
        construct: bool,
        constructor_args: Vec<Blob>,
        constructor_kwargs: BTreeMap<String, Blob>,
        args: Vec<Blob>,
        kwargs: BTreeMap<String, Blob>,
    },
    CallDeployed {
        module: String,
        name: String,
        args: Vec<Blob>,
        kwargs: BTreeMap<String, Blob>,
    },
    DescribeClass {
        class_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// An HTTP endpoint discovered on a class by `DescribeClass`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EndpointSpec {
    pub method_name: String,
    pub route: String,
    pub http_methods: Vec<String>,
}

/// A reply frame from the interpreter.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ShimReply {
    pub ok: bool,

    /// Blob-encoded return value on success.
    #[serde(default)]
    pub result: Option<Blob>,

    /// Error text (message plus traceback) on failure.
    #[serde(default)]
    pub error: Option<String>,

    /// Combined stdout/stderr/log capture from the invocation.
    #[serde(default)]
    pub stdout: String,

    /// Endpoint descriptions, for `DescribeClass` only.
    #[serde(default)]
    pub endpoints: Option<Vec<EndpointSpec>>,
}

impl ShimReply {
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown interpreter error")
    }
}

struct ShimProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,

    // Keeps the script file alive for the child's lifetime.
    _script: tempfile::NamedTempFile,
}

/// Handle to the interpreter subprocess.
pub struct ShimHost {
    layout: WorkspaceLayout,
    process: Mutex<Option<ShimProcess>>,
    generation: AtomicU64,
}

impl ShimHost {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            layout,
            process: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Monotonic counter bumped on every (re)spawn. State derived from a
    /// previous generation's child is stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Send one request and read its reply, spawning the interpreter on
    /// first use and respawning it after a crash.
    #[instrument(skip(self, request))]
    pub async fn call(&self, request: &ShimRequest) -> Result<ShimReply> {
        let mut slot = self.process.lock().await;

        if let Some(process) = slot.as_mut() {
            if process.child.try_wait().ok().flatten().is_some() {
                warn!("interpreter exited, respawning");
                *slot = None;
            }
        }
        if slot.is_none() {
            *slot = Some(self.spawn().await?);
        }
        let Some(process) = slot.as_mut() else {
            bail!("interpreter failed to spawn");
        };

        match Self::exchange(process, request).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                // A broken pipe mid-exchange poisons the stream; drop the
                // child so the next request starts clean.
                warn!(?err, "interpreter exchange failed, dropping child");
                let _ = process.child.start_kill();
                *slot = None;
                Err(err)
            }
        }
    }

    async fn exchange(process: &mut ShimProcess, request: &ShimRequest) -> Result<ShimReply> {
        let body = serde_json::to_vec(request).context("serialize shim request")?;
        let header = u32::try_from(body.len())
            .context("frame too large")?
            .to_be_bytes();
        process.stdin.write_all(&header).await.context("write frame header")?;
        process.stdin.write_all(&body).await.context("write frame body")?;
        process.stdin.flush().await.context("flush frame")?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        process
            .stdout
            .read_exact(&mut header)
            .await
            .context("read reply header")?;
        let length = u32::from_be_bytes(header);
        if length > MAX_FRAME_LEN {
            bail!("reply frame of {length} bytes exceeds the frame cap");
        }

        let mut body = vec![0u8; length as usize];
        process
            .stdout
            .read_exact(&mut body)
            .await
            .context("read reply body")?;
        serde_json::from_slice(&body).context("parse shim reply")
    }

    async fn spawn(&self) -> Result<ShimProcess> {
        let script = tempfile::Builder::new()
            .prefix("flash-shim-")
            .suffix(".py")
            .tempfile()
            .context("create shim script file")?;
        tokio::fs::write(script.path(), HOST_SCRIPT)
            .await
            .context("write shim script")?;

        let python = self.interpreter().await;
        debug!(?python, "spawning interpreter");

        let mut child = Command::new(&python)
            .arg(script.path())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn interpreter: {}", python.display()))?;

        let stdin = child.stdin.take().context("take interpreter stdin")?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .context("take interpreter stdout")?;

        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(ShimProcess {
            child,
            stdin,
            stdout,
            _script: script,
        })
    }

    /// The interpreter to host user code in: the volume venv's when one is
    /// present on disk, otherwise whatever `python3` resolves to.
    async fn interpreter(&self) -> PathBuf {
        match self.layout.python_exe() {
            Some(python) if python.exists() => python,
            _ => PathBuf::from("python3"),
        }
    }
}
