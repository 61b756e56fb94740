//! Host-side cell rewriting: checks before a cell is sent, cleanup after.

use std::collections::BTreeMap;

/// Marker the shell helper prints when a command exceeds its timeout.
pub const COMMAND_TIMEOUT_MARKER: &str = "Command timed out after";

/// Exit status the shell helper reports for a timed-out command.
pub const COMMAND_TIMEOUT_STATUS: i32 = 124;

/// Builtin the kernel installs per run; the shell helper calls it on a
/// timeout so the result carries `command_timed_out`.
pub const COMMAND_TIMEOUT_HOOK: &str = "_runtime_note_command_timeout";

/// Reject cells whose `%%` magic is repeated or not at the top.
///
/// Blank lines and `#` comments may precede the magic.
pub fn validate_cell_magics(code: &str) -> std::result::Result<(), String> {
    let mut seen_code = false;
    let mut seen_magic = false;

    for line in code.split('\n') {
        let stripped = line.trim_start();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        if stripped.starts_with("%%") {
            if seen_magic || seen_code {
                return Err(
                    "SyntaxError: Cell contains multiple %%cell magics or cell magic not at start. \
                     IPython/Jupyter allows only one %%cell magic per cell at the beginning."
                        .to_string(),
                );
            }
            seen_magic = true;
        }
        seen_code = true;
    }
    Ok(())
}

/// Inputs for rewriting `!` lines when the kernel has no IPython.
#[derive(Debug, Clone)]
pub struct ShellContext<'a> {
    /// Interpreter used for `!pip install`
    pub python: &'a str,
    /// Working directory as the kernel sees it
    pub workspace: &'a str,
    pub env: &'a BTreeMap<String, String>,
}

/// Rewrite `!cmd` lines into calls to a generated `_run_shell_command`.
///
/// The common indentation of the cell is removed; relative indentation is
/// kept so `!` lines inside blocks stay inside them. `%` lines pass through.
pub fn fallback_transform(code: &str, ctx: &ShellContext<'_>) -> String {
    let lines: Vec<&str> = code.split('\n').collect();

    let min_indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| indent_of(l))
        .min()
        .unwrap_or(0);

    let mut out = Vec::with_capacity(lines.len());
    let mut uses_helper = false;
    for line in &lines {
        if line.trim().is_empty() {
            out.push(line.to_string());
            continue;
        }
        let indent = indent_of(line);
        let relative = &line[min_indent..indent];
        let stripped = &line[indent..];

        if let Some(command) = stripped.strip_prefix('!') {
            let command = shell_command(command.trim(), ctx.python);
            out.push(format!("{}_run_shell_command({})", relative, quote(&command)));
            uses_helper = true;
        } else {
            out.push(line[min_indent..].to_string());
        }
    }

    let body = out.join("\n");
    if uses_helper {
        format!("{}\n{}", shell_helper(ctx), body)
    } else {
        body
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn shell_command(command: &str, python: &str) -> String {
    let mut words = command.split_whitespace();
    if words.next() == Some("pip") && words.next() == Some("install") {
        let rest: Vec<&str> = words.collect();
        return format!(
            "{} -m pip install {} --disable-pip-version-check",
            python,
            rest.join(" ")
        );
    }
    command.to_string()
}

/// A JSON string is also a valid Python string literal.
fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn shell_helper(ctx: &ShellContext<'_>) -> String {
    let env = serde_json::to_string(ctx.env).unwrap_or_else(|_| "{}".to_string());
    format!(
        r#"
import subprocess as _subprocess_module
import sys as _sys_module

def _run_shell_command(cmd, timeout=None):
    import os as _os_module
    env = _os_module.environ.copy()
    env.update({env})
    try:
        result = _subprocess_module.run(
            cmd,
            shell=True,
            stdout=_subprocess_module.PIPE,
            stderr=_subprocess_module.PIPE,
            text=True,
            cwd={cwd},
            timeout=timeout,
            env=env,
        )
        if result.stdout:
            _sys_module.stdout.write(result.stdout)
            _sys_module.stdout.flush()
        if result.stderr:
            _sys_module.stderr.write(result.stderr)
            _sys_module.stderr.flush()
        return result.returncode
    except _subprocess_module.TimeoutExpired:
        print(f"{marker} {{timeout}}s", file=_sys_module.stderr)
        _note = getattr(_sys_module.modules["builtins"], "{hook}", None)
        if _note is not None:
            _note()
        return {status}
"#,
        env = env,
        cwd = quote(ctx.workspace),
        marker = COMMAND_TIMEOUT_MARKER,
        status = COMMAND_TIMEOUT_STATUS,
        hook = COMMAND_TIMEOUT_HOOK,
    )
}

/// Normalize captured IPython output.
///
/// `Out[N]:` prefixes are dropped (their content kept), blank lines removed,
/// and a single trailing newline added to non-empty output.
pub fn clean_rich_output(output: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();
    for line in output.split('\n') {
        if let Some(content) = strip_out_prompt(line) {
            let content = content.trim();
            if !content.is_empty() {
                cleaned.push(content);
            }
            continue;
        }
        cleaned.push(line);
    }

    let joined = cleaned.join("\n");
    let lines: Vec<&str> = joined.trim().split('\n').filter(|l| !l.is_empty()).collect();
    let result = lines.join("\n");
    if result.is_empty() {
        result
    } else {
        result + "\n"
    }
}

/// `Out[12]: value` → `Some(" value")`.
fn strip_out_prompt(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("Out[")?;
    let close = rest.find("]:")?;
    if close == 0 || !rest[..close].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(&rest[close + 2..])
}

/// Post-process a rich-mode run: reword unknown magics, drop the empty
/// cell-body usage error, and surface tracebacks that only reached stdout.
pub fn classify_rich_output(stdout: String, error: Option<String>) -> (String, Option<String>) {
    let lower = stdout.to_lowercase();
    let stdout = if lower.contains("magic function") && lower.contains("not found") {
        stdout.replace("not found", "unknown magic")
    } else {
        stdout
    };

    let mut error = error.filter(|e| !e.contains("cell body is empty"));

    if error.is_none() && !stdout.is_empty() {
        let empty_body = stdout.contains("cell body is empty");
        let promote = stdout.contains("Traceback")
            || (!empty_body
                && stdout.contains("SyntaxError")
                && !(stdout.contains("invalid syntax") && stdout.contains("echo")))
            || (!empty_body && stdout.contains("UsageError"));
        if promote {
            error = Some(stdout.clone());
        }
    }
    (stdout, error)
}
