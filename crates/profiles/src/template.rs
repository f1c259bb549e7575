//! Placeholder expansion for launch templates.
//!
//! `$command` is special: inside a run command it expands to the whole worker
//! invocation, inside a manager template it expands to the rendered run
//! command being wrapped. The remaining placeholders expand to single values.
//!
//! Expansion is a single left-to-right pass: text that came from a value is
//! never scanned for placeholders again.

pub const COMMAND: &str = "$command";
pub const EXECUTABLE: &str = "$executable";
pub const ADDRESS: &str = "$address";
pub const PORT: &str = "$port";
pub const CODE: &str = "$code";
pub const THREADS: &str = "$threads";

/// Per-slot values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct LaunchValues<'a> {
    pub executable: &'a str,
    /// Comma-joined master addresses.
    pub addresses: &'a str,
    pub port: u16,
    pub code: &'a str,
    pub threads: u32,
}

impl LaunchValues<'_> {
    /// `<executable> <addresses> <port> <code> <threads>`, the argument order
    /// `job-worker` expects.
    pub fn worker_invocation(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.executable, self.addresses, self.port, self.code, self.threads
        )
    }

    fn render(&self, template: &str, command: &str) -> String {
        let port = self.port.to_string();
        let threads = self.threads.to_string();
        expand(
            template,
            &[
                (COMMAND, command),
                (EXECUTABLE, self.executable),
                (ADDRESS, self.addresses),
                (PORT, port.as_str()),
                (CODE, self.code),
                (THREADS, threads.as_str()),
            ],
        )
    }
}

/// What `$command` in a run command becomes once the executable is known
/// but the per-slot values are not.
pub fn worker_invocation_template(executable: &str) -> String {
    format!("{executable} {ADDRESS} {PORT} {CODE} {THREADS}")
}

fn expand(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        match values.iter().find(|(token, _)| tail.starts_with(token)) {
            Some((token, value)) => {
                out.push_str(value);
                rest = &tail[token.len()..];
            }
            None => {
                out.push('$');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn render_run_command(template: &str, values: &LaunchValues<'_>) -> String {
    values.render(template, &values.worker_invocation())
}

pub fn render_manager_command(
    template: &str,
    rendered_run_command: &str,
    values: &LaunchValues<'_>,
) -> String {
    values.render(template, rendered_run_command)
}
