use std::{ffi::OsString, process::Stdio, time::Duration};

use sdloop_core::{Field, Mode, GENERATION_DONE};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{AdapterConfig, AdapterError, Request};

/// How long a pipeline gets to exit on its own once its input is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// What a pipeline was started with. A request with a different key needs a new pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LaunchKey {
    pub(crate) mode: Mode,
    pub(crate) strength: Option<f64>,
}

impl LaunchKey {
    pub(crate) fn of(request: &Request) -> Self {
        Self {
            mode: request.mode,
            strength: request.strength,
        }
    }
}

/// An interactive pipeline that has finished at least one generation and waits for input.
pub(crate) struct RunningPipeline {
    pub(crate) key: LaunchKey,
    child: Child,
    stdin: ChildStdin,
    done: mpsc::UnboundedReceiver<()>,
    next_seed: u64,
}

impl RunningPipeline {
    /// Starts an interactive pipeline for `request` and waits until it has generated it.
    pub(crate) async fn launch(
        config: &AdapterConfig,
        request: &Request,
    ) -> Result<Self, AdapterError> {
        let (mut child, done) = spawn(config, request, true)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AdapterError::Io(std::io::Error::other("pipeline stdin was not captured"))
        })?;
        let mut pipeline = Self {
            key: LaunchKey::of(request),
            child,
            stdin,
            done,
            next_seed: request.seed,
        };
        pipeline.wait_for_generation().await?;
        Ok(pipeline)
    }

    /// Sends the next request over stdin and waits for its completion.
    pub(crate) async fn submit(&mut self, request: &Request) -> Result<(), AdapterError> {
        if request.seed != self.next_seed {
            warn!(
                requested = request.seed,
                used = self.next_seed,
                "running pipeline continues its own seed sequence"
            );
        }
        let mut lines = String::new();
        for &field in self.key.mode.fields() {
            lines.push_str(&request.field(field));
            lines.push('\n');
        }
        self.stdin.write_all(lines.as_bytes()).await?;
        self.stdin.flush().await?;
        self.wait_for_generation().await
    }

    async fn wait_for_generation(&mut self) -> Result<(), AdapterError> {
        match self.done.recv().await {
            Some(()) => {
                self.next_seed = self.next_seed.wrapping_add(1);
                Ok(())
            }
            None => {
                let status = self.child.wait().await?;
                Err(AdapterError::PipelineExited {
                    mode: self.key.mode,
                    status: status.to_string(),
                })
            }
        }
    }

    pub(crate) async fn kill(mut self) {
        info!(mode = %self.key.mode, "stopping pipeline");
        if let Err(err) = self.child.kill().await {
            warn!(mode = %self.key.mode, "failed to kill pipeline: {err}");
        }
    }

    /// Closes the pipeline's input, which ends its session, and waits for it to exit.
    pub(crate) async fn close(self) -> Result<(), AdapterError> {
        let Self {
            key,
            mut child,
            stdin,
            ..
        } = self;
        drop(stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(mode = %key.mode, %status, "pipeline exited");
                Ok(())
            }
            Err(_) => {
                warn!(mode = %key.mode, "pipeline did not exit, killing it");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Runs `request` in a pipeline started just for it.
pub(crate) async fn run_once(config: &AdapterConfig, request: &Request) -> Result<(), AdapterError> {
    let (mut child, _done) = spawn(config, request, false)?;
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(AdapterError::PipelineFailed {
            mode: request.mode,
            status: status.to_string(),
        })
    }
}

fn spawn(
    config: &AdapterConfig,
    request: &Request,
    interactive: bool,
) -> Result<(Child, mpsc::UnboundedReceiver<()>), AdapterError> {
    let command = config.command(request.mode);
    let mut args: Vec<OsString> = command.args.iter().map(OsString::from).collect();
    args.extend(request.launch_args(config.models.model(request.mode)));
    args.extend(config.extra_args.iter().map(OsString::from));
    if interactive {
        args.push("--interactive".into());
    }
    info!(mode = %request.mode, program = %command.program.display(), ?args, "launching pipeline");

    let mut cmd = Command::new(&command.program);
    cmd.args(&args)
        .stdin(if interactive {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(hf_home) = &config.hf_home {
        cmd.env("HF_HOME", hf_home);
    }
    let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
        program: command.program.display().to_string(),
        source,
    })?;

    let (done_tx, done_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(request.mode, stdout, Some(done_tx)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(request.mode, stderr, None));
    }
    Ok((child, done_rx))
}

/// Logs every line of a pipeline stream. On stdout, each completion sentinel is signalled on
/// `done`; the sender is dropped when the stream closes.
async fn forward_lines<R>(mode: Mode, stream: R, done: Option<mpsc::UnboundedSender<()>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(%mode, "{line}");
                if line.trim() == GENERATION_DONE {
                    if let Some(done) = &done {
                        let _ = done.send(());
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%mode, "failed to read pipeline output: {err}");
                break;
            }
        }
    }
}

impl Request {
    /// Flags of a launch that generates this request first.
    fn launch_args(&self, model: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--model".into(),
            model.into(),
            "--prompt".into(),
            self.prompt.as_str().into(),
            "--output".into(),
            self.output.as_os_str().to_owned(),
            "--seed".into(),
            self.seed.to_string().into(),
        ];
        if let Some(init_image) = &self.init_image {
            args.push("--init-image".into());
            args.push(init_image.as_os_str().to_owned());
        }
        if let Some(mask) = &self.mask {
            args.push("--mask".into());
            args.push(mask.as_os_str().to_owned());
        }
        if let Some(strength) = self.strength {
            args.push("--strength".into());
            args.push(strength.to_string().into());
        }
        args
    }

    /// The value of `field` as written on the pipeline's stdin.
    fn field(&self, field: Field) -> String {
        let path = |path: Option<&std::path::PathBuf>| {
            path.map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        match field {
            Field::Prompt => self.prompt.clone(),
            Field::Output => self.output.to_string_lossy().into_owned(),
            Field::InitImage => path(self.init_image.as_ref()),
            Field::Mask => path(self.mask.as_ref()),
        }
    }
}
