use std::path::Path;

pub const DEFAULT_DEV_COMMAND: &str = "npx";
pub const DEFAULT_DEV_ARGS: &str = "slidev {entry} --port {port} --base {base} --bind 127.0.0.1";

/// Command line used to start one preview dev server.
///
/// NOTE: This is fixed by the operator at startup. Request data only ever
/// reaches the child through the placeholders below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevServerTemplate {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub entry: &'a Path,
    pub port: u16,
    pub base: &'a str,
    pub id: &'a str,
}

impl Default for DevServerTemplate {
    fn default() -> Self {
        Self {
            command: DEFAULT_DEV_COMMAND.to_string(),
            args: split_args(DEFAULT_DEV_ARGS),
        }
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

impl DevServerTemplate {
    pub fn parse(command: &str, args: &str) -> anyhow::Result<Self> {
        let command = command.trim();
        if command.is_empty() {
            anyhow::bail!("dev server command must be non-empty");
        }
        Ok(Self {
            command: command.to_string(),
            args: split_args(args),
        })
    }

    /// Substitutes `{entry}`, `{port}`, `{base}` and `{id}`; anything else is
    /// passed through verbatim.
    pub fn render(&self, vars: &TemplateVars<'_>) -> (String, Vec<String>) {
        let entry = vars.entry.display().to_string();
        let port = vars.port.to_string();
        let args = self
            .args
            .iter()
            .map(|a| {
                a.replace("{entry}", &entry)
                    .replace("{port}", &port)
                    .replace("{base}", vars.base)
                    .replace("{id}", vars.id)
            })
            .collect();
        (self.command.clone(), args)
    }
}
