//! Per-language launch commands and the stdin/stdout protocol
//!
//! Every runtime runs a small driver loop that reads one framed block at a
//! time from stdin, executes it in a persistent scope, and then prints the
//! end marker on both stdout and stderr:
//!
//! ```text
//! host ──frame(source)──► stdin ──► driver: exec in persistent scope
//!                                      │
//!  stdout: <output lines> ... "##end_of_execution## <status>"
//!  stderr: <error lines>  ... "##end_of_execution##"
//! ```
//!
//! The block is complete once both markers are seen, so no output written
//! before completion can be lost between the two pipes. On startup every
//! driver prints `##runtime_ready##` on stdout once it can accept blocks.

use crate::config::RuntimeCommands;

use super::language::Language;

/// Marker printed by every driver after a block finishes
pub const END_MARKER: &str = "##end_of_execution##";

/// Line printed by every driver once it is ready for the first block
pub const READY_MARKER: &str = "##runtime_ready##";

/// Prefix of a driver line carrying an inline image: `##image## <mime> <base64>`
pub const IMAGE_PREFIX: &str = "##image##";

const PYTHON_DRIVER: &str = r###"
import json, os, sys, traceback
_commands = sys.stdin
sys.stdin = open(os.devnull)
_scope = {"__name__": "__main__", "__builtins__": __builtins__}
def _finish(status):
    sys.stdout.flush()
    sys.stderr.flush()
    sys.stdout.write("##end_of_execution## %d\n" % status)
    sys.stdout.flush()
    sys.stderr.write("##end_of_execution##\n")
    sys.stderr.flush()
sys.stdout.write("##runtime_ready##\n")
sys.stdout.flush()
while True:
    try:
        line = _commands.readline()
    except KeyboardInterrupt:
        continue
    if not line:
        break
    status = 0
    try:
        exec(compile(json.loads(line), "<block>", "exec"), _scope)
    except SystemExit as e:
        status = 0 if e.code is None else (e.code if isinstance(e.code, int) else 1)
    except KeyboardInterrupt:
        sys.stderr.write("KeyboardInterrupt\n")
        status = 130
    except BaseException:
        traceback.print_exc()
        status = 1
    _finish(status)
"###;

const JAVASCRIPT_DRIVER: &str = r#"
const vm = require('vm');
const readline = require('readline');
globalThis.require = require;
process.on('SIGINT', () => {});
const rl = readline.createInterface({ input: process.stdin, terminal: false });
process.stdout.write('##runtime_ready##\n');
rl.on('line', (line) => {
  let status = 0;
  try {
    vm.runInThisContext(JSON.parse(line), { filename: 'block.js', breakOnSigint: true });
  } catch (err) {
    status = 1;
    process.stderr.write(String(err && err.stack ? err.stack : err) + '\n');
  }
  process.stdout.write('##end_of_execution## ' + status + '\n');
  process.stderr.write('##end_of_execution##\n');
});
"#;

const POWERSHELL_DRIVER: &str = r###"
$ErrorActionPreference = 'Continue'
[Console]::Out.WriteLine("##runtime_ready##")
[Console]::Out.Flush()
while ($true) {
  $line = [Console]::In.ReadLine()
  if ($null -eq $line) { break }
  $status = 0
  try {
    $code = $line | ConvertFrom-Json
    Invoke-Expression $code | Out-Host
    if (-not $?) { $status = 1 }
  } catch {
    [Console]::Error.WriteLine($_.ToString())
    $status = 1
  }
  [Console]::Out.WriteLine("##end_of_execution## $status")
  [Console]::Out.Flush()
  [Console]::Error.WriteLine("##end_of_execution##")
  [Console]::Error.Flush()
}
"###;

/// Keeps the shell alive when the block's process group is interrupted
const SHELL_PREAMBLE: &str = "trap ':' INT\nprintf '%s\\n' '##runtime_ready##'\n";

const SHELL_HEREDOC_TAG: &str = "__LOCALAGENT_BLOCK__";

/// How to start one runtime process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to stdin once, right after spawn
    pub preamble: Option<String>,
}

/// Build the launch spec for a language, or `None` when it has no runtime
pub fn launch_spec(language: &Language, commands: &RuntimeCommands) -> Option<LaunchSpec> {
    let with_driver = |spec: &crate::config::CommandSpec, driver: &str| {
        let mut args = spec.args.clone();
        args.push(driver.to_string());
        LaunchSpec {
            program: spec.program.clone(),
            args,
            preamble: None,
        }
    };

    match language {
        Language::Python => Some(with_driver(&commands.python, PYTHON_DRIVER)),
        Language::JavaScript => Some(with_driver(&commands.javascript, JAVASCRIPT_DRIVER)),
        Language::PowerShell => Some(with_driver(&commands.powershell, POWERSHELL_DRIVER)),
        Language::Shell => Some(LaunchSpec {
            program: commands.shell.program.clone(),
            args: commands.shell.args.clone(),
            preamble: Some(SHELL_PREAMBLE.to_string()),
        }),
        Language::Unsupported(_) => None,
    }
}

/// Encode a block for the driver's stdin
pub fn frame(language: &Language, source: &str) -> String {
    match language {
        Language::Shell => {
            // eval keeps syntax errors inside the block; stdin is detached so
            // `read` cannot swallow the marker lines
            format!(
                "eval \"$(cat <<'{tag}'\n{source}\n{tag}\n)\" </dev/null\n\
                 __localagent_status=$?\n\
                 printf '%s %s\\n' '{marker}' \"$__localagent_status\"\n\
                 printf '%s\\n' '{marker}' >&2\n",
                tag = SHELL_HEREDOC_TAG,
                source = source.trim_end_matches('\n'),
                marker = END_MARKER,
            )
        }
        _ => {
            // A JSON string literal is also a valid Python/JS/PowerShell JSON payload
            let mut line = serde_json::Value::String(source.to_string()).to_string();
            line.push('\n');
            line
        }
    }
}

/// Split a line at the end marker
///
/// Returns the text printed before the marker (output without a trailing
/// newline ends up on the marker line) and the exit status, if any.
pub fn split_marker(line: &str) -> Option<(&str, Option<i32>)> {
    let idx = line.find(END_MARKER)?;
    let before = &line[..idx];
    let status = line[idx + END_MARKER.len()..].trim().parse().ok();
    Some((before, status))
}

/// Parse an inline image line into `(mime, base64)`
pub fn parse_image(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(IMAGE_PREFIX)?.trim();
    let (mime, data) = rest.split_once(char::is_whitespace)?;
    let data = data.trim();
    if mime.contains('/') && !data.is_empty() {
        Some((mime, data))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_marker() {
        assert_eq!(split_marker("##end_of_execution## 0"), Some(("", Some(0))));
        assert_eq!(split_marker("partial##end_of_execution## 2"), Some(("partial", Some(2))));
        assert_eq!(split_marker("##end_of_execution##"), Some(("", None)));
        assert_eq!(split_marker("regular output"), None);
    }

    #[test]
    fn test_json_frame_is_single_line() {
        let framed = frame(&Language::Python, "x = 1\nprint(\"a\\tb\")\n");
        assert_eq!(framed.matches('\n').count(), 1);
        let decoded: String = serde_json::from_str(framed.trim_end()).unwrap();
        assert_eq!(decoded, "x = 1\nprint(\"a\\tb\")\n");
    }

    #[test]
    fn test_shell_frame_wraps_in_heredoc() {
        let framed = frame(&Language::Shell, "echo hi\n");
        assert!(framed.starts_with("eval \"$(cat <<'__LOCALAGENT_BLOCK__'\necho hi\n__LOCALAGENT_BLOCK__\n)\""));
        assert!(framed.contains("'##end_of_execution##' \"$__localagent_status\""));
        assert!(framed.ends_with(">&2\n"));
    }

    #[test]
    fn test_launch_specs() {
        let commands = RuntimeCommands::default();
        let python = launch_spec(&Language::Python, &commands).unwrap();
        assert_eq!(python.args.last().map(String::as_str), Some(PYTHON_DRIVER));
        let shell = launch_spec(&Language::Shell, &commands).unwrap();
        assert_eq!(shell.preamble.as_deref(), Some(SHELL_PREAMBLE));
        assert!(launch_spec(&Language::Unsupported("cobol".into()), &commands).is_none());
    }

    #[test]
    fn test_every_driver_announces_readiness() {
        let commands = RuntimeCommands::default();
        for language in Language::SUPPORTED.iter() {
            let spec = launch_spec(language, &commands).unwrap();
            let script = spec.preamble.as_deref().or(spec.args.last().map(String::as_str)).unwrap();
            assert!(script.contains(READY_MARKER), "{language}");
        }
        // Raw strings must survive the markers' `"#` sequences intact
        assert!(PYTHON_DRIVER.trim_end().ends_with("_finish(status)"));
        assert!(POWERSHELL_DRIVER.trim_end().ends_with('}'));
    }

    #[test]
    fn test_parse_image() {
        assert_eq!(parse_image("##image## image/png iVBORw0KGgo="), Some(("image/png", "iVBORw0KGgo=")));
        assert_eq!(parse_image("##image## nonsense"), None);
        assert_eq!(parse_image("plain"), None);
    }
}
