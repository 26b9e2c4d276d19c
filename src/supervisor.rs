//! The shell supervisor loop that runs inside each tmux session.
//!
//! The loop, not the server, owns the assistant subprocess: it blocks on the
//! session FIFO (the open is the wake signal), appends subprocess stdout to
//! `out.jsonl`, and restarts on exit with 1 s / 3 s / 10 s backoff. More than
//! five restarts inside sixty seconds trips a circuit breaker: a terminal
//! `system` frame is appended and the loop exits 1.
//!
//! The script is rendered to `sessions/<id>/run.sh` so a tmux session created
//! by one server build keeps working after the binary is replaced.
//!
//! Usage inside tmux: `sh run.sh <session_dir> <model> <project_dir>
//! <assistant_bin>`.

use std::path::{Path, PathBuf};

use tokio::fs;

/// POSIX sh; SIGINT is trapped to a no-op so an interrupt only ever reaches
/// the inner assistant process.
const SUPERVISOR_SCRIPT: &str = r#"#!/bin/sh
# abridge session supervisor
# usage: run.sh <session_dir> <model> <project_dir> <assistant_bin>

SESSION_DIR="$1"
MODEL="$2"
PROJECT_DIR="$3"
ASSISTANT_BIN="${4:-claude}"

trap '' INT

[ -p "$SESSION_DIR/input.fifo" ] || mkfifo "$SESSION_DIR/input.fifo"
touch "$SESSION_DIR/out.jsonl"

# A nested assistant detects these and refuses stream mode.
unset CLAUDECODE CLAUDE_CODE_ENTRYPOINT CLAUDE_CODE_SSE_PORT

cd "$PROJECT_DIR" || exit 1

emit_system() {
    printf '{"type":"stream_item","item":{"kind":"system","text":"%s","id":"sys-%s-%s","timestamp":"%s"}}\n' \
        "$1" "$(date +%s)" "$$" "$(date -u +%Y-%m-%dT%H:%M:%SZ)" \
        >> "$SESSION_DIR/out.jsonl"
}

RESTARTS=""
while :; do
    NOW=$(date +%s)
    RECENT=""
    COUNT=0
    for T in $RESTARTS; do
        if [ $((NOW - T)) -lt 60 ]; then
            RECENT="$RECENT $T"
            COUNT=$((COUNT + 1))
        fi
    done
    RESTARTS="$RECENT"
    if [ "$COUNT" -gt 5 ]; then
        emit_system "Circuit breaker tripped: assistant crashed 5 times in 60s. Session terminated."
        exit 1
    fi

    RESUME=""
    if [ -s "$SESSION_DIR/resume_id" ]; then
        RESUME="--resume $(cat "$SESSION_DIR/resume_id")"
    fi

    "$ASSISTANT_BIN" \
        --input-format stream-json \
        --output-format stream-json \
        --verbose \
        --include-partial-messages \
        --model "$MODEL" \
        --dangerously-skip-permissions \
        $RESUME \
        < "$SESSION_DIR/input.fifo" \
        >> "$SESSION_DIR/out.jsonl" \
        2>> "$SESSION_DIR/err.log"

    emit_system "assistant process exited, awaiting reconnection..."

    RESTARTS="$RESTARTS $NOW"
    if [ "$COUNT" -ge 3 ]; then
        sleep 10
    elif [ "$COUNT" -ge 1 ]; then
        sleep 3
    else
        sleep 1
    fi
done
"#;

/// Path of the rendered script inside a session directory.
pub fn script_path(session_dir: &Path) -> PathBuf {
    session_dir.join("run.sh")
}

/// Render the supervisor script into the session directory. Overwrites any
/// previous render so script fixes reach existing sessions on their next
/// tmux start.
pub async fn write_script(session_dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(session_dir).await?;
    let path = script_path(session_dir);
    fs::write(&path, SUPERVISOR_SCRIPT).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_traps_sigint() {
        assert!(SUPERVISOR_SCRIPT.contains("trap '' INT"));
    }

    #[test]
    fn test_script_circuit_breaker_message() {
        assert!(SUPERVISOR_SCRIPT
            .contains("Circuit breaker tripped: assistant crashed 5 times in 60s. Session terminated."));
        assert!(SUPERVISOR_SCRIPT.contains(r#"[ "$COUNT" -gt 5 ]"#));
        assert!(SUPERVISOR_SCRIPT.contains("exit 1"));
    }

    #[test]
    fn test_script_reconnection_frame() {
        assert!(SUPERVISOR_SCRIPT.contains("assistant process exited, awaiting reconnection..."));
    }

    #[test]
    fn test_script_resume_flag_from_file() {
        assert!(SUPERVISOR_SCRIPT.contains(r#"-s "$SESSION_DIR/resume_id""#));
        assert!(SUPERVISOR_SCRIPT.contains("--resume"));
    }

    #[test]
    fn test_script_stream_flags() {
        for flag in [
            "--input-format stream-json",
            "--output-format stream-json",
            "--verbose",
            "--include-partial-messages",
            "--dangerously-skip-permissions",
        ] {
            assert!(SUPERVISOR_SCRIPT.contains(flag), "missing {flag}");
        }
    }

    #[test]
    fn test_script_unsets_nesting_env() {
        assert!(SUPERVISOR_SCRIPT.contains("unset CLAUDECODE"));
    }

    #[tokio::test]
    async fn test_write_script() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_script(dir.path()).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("#!/bin/sh"));
    }
}
