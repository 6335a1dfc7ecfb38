use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use futures_util::future::BoxFuture;
use slidegate_process::ResourceId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

use crate::templates::{DevServerTemplate, TemplateVars};

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub resource_id: ResourceId,
    /// Absolute path of the project's entry document.
    pub entry: PathBuf,
    pub port: u16,
}

/// Signals a launched process (and whatever it spawned).
pub trait ProcessControl: Send + Sync {
    fn terminate(&self);
    fn kill(&self);
}

pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub control: Arc<dyn ProcessControl>,
    /// Resolves once the process has fully exited, with its exit code if any.
    pub exited: BoxFuture<'static, Option<i32>>,
}

pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess>;
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the gateway dies, take the dev server down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Signals the whole process group started by `setsid`, so `npx` and the
/// node process it execs go down together.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn signal(&self, _sig: i32) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, _sig);
            }
        }
    }
}

impl ProcessControl for ProcessGroup {
    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
    }

    fn kill(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }
}

/// Spawns the configured dev server as a real child process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    template: DevServerTemplate,
    public_prefix: String,
}

impl CommandLauncher {
    pub fn new(template: DevServerTemplate, public_prefix: impl Into<String>) -> Self {
        Self {
            template,
            public_prefix: public_prefix.into(),
        }
    }

    /// Public route the dev server must serve its assets under.
    pub fn base_for(&self, id: &ResourceId) -> String {
        format!("{}/{}/", self.public_prefix.trim_end_matches('/'), id)
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess> {
        let base = self.base_for(&spec.resource_id);
        let (exec, args) = self.template.render(&TemplateVars {
            entry: &spec.entry,
            port: spec.port,
            base: &base,
            id: spec.resource_id.as_str(),
        });
        let cwd = spec
            .entry
            .parent()
            .ok_or_else(|| anyhow::anyhow!("entry has no parent dir: {}", spec.entry.display()))?
            .to_path_buf();

        let mut cmd = Command::new(&exec);
        cmd.args(&args)
            .current_dir(&cwd)
            .env("PORT", spec.port.to_string())
            .env("SLIDEGATE_RESOURCE_ID", spec.resource_id.as_str())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so we can signal the whole process tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(
            resource_id = %spec.resource_id,
            port = spec.port,
            cwd = %cwd.display(),
            "exec: {} {}",
            exec,
            args.join(" ")
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn dev server: exec={exec} (cwd {})", cwd.display()))?;
        let pid = child.id();

        if let Some(out) = child.stdout.take() {
            let id = spec.resource_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "slidegate::devserver", resource_id = %id, "[stdout] {line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let id = spec.resource_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "slidegate::devserver", resource_id = %id, "[stderr] {line}");
                }
            });
        }

        let id = spec.resource_id.clone();
        let exited = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(resource_id = %id, error = %err, "wait on dev server failed");
                    None
                }
            }
        });

        Ok(LaunchedProcess {
            pid,
            control: Arc::new(ProcessGroup {
                pgid: pid.map(|p| p as i32),
            }),
            exited,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn scratch_entry() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slidegate-launch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let entry = dir.join("slides.md");
        std::fs::write(&entry, "# hello\n").unwrap();
        entry
    }

    #[test]
    fn base_is_scoped_to_resource() {
        let l = CommandLauncher::new(DevServerTemplate::default(), "/api/slides/preview/");
        assert_eq!(l.base_for(&ResourceId::from(42)), "/api/slides/preview/42/");
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let entry = scratch_entry();
        let l = CommandLauncher::new(
            DevServerTemplate::parse("/nonexistent/slidegate-dev-server", "{port}").unwrap(),
            "/p",
        );
        let err = l
            .launch(&LaunchSpec {
                resource_id: ResourceId::from(1),
                entry: entry.clone(),
                port: 1,
            })
            .err()
            .unwrap();
        assert!(err.to_string().contains("spawn dev server"));
        let _ = std::fs::remove_dir_all(entry.parent().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_reaches_the_process_group() {
        let entry = scratch_entry();
        let l = CommandLauncher::new(DevServerTemplate::parse("sleep", "30").unwrap(), "/p");
        let launched = l
            .launch(&LaunchSpec {
                resource_id: ResourceId::from(2),
                entry: entry.clone(),
                port: 1,
            })
            .unwrap();
        assert!(launched.pid.is_some());

        launched.control.terminate();
        let code = tokio::time::timeout(Duration::from_secs(5), launched.exited)
            .await
            .expect("process did not exit after SIGTERM");
        // Killed by a signal, so there is no exit code.
        assert_eq!(code, None);
        let _ = std::fs::remove_dir_all(entry.parent().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let entry = scratch_entry();
        let l = CommandLauncher::new(DevServerTemplate::parse("false", "").unwrap(), "/p");
        let launched = l
            .launch(&LaunchSpec {
                resource_id: ResourceId::from(3),
                entry: entry.clone(),
                port: 1,
            })
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), launched.exited)
            .await
            .unwrap();
        assert_eq!(code, Some(1));
        let _ = std::fs::remove_dir_all(entry.parent().unwrap());
    }
}
