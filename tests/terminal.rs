//! Pipelines that inherit a terminal stdin. Each test re-runs itself inside
//! a pseudo-terminal (via util-linux `script`) and checks what the inner run
//! printed.
#![cfg(target_os = "linux")]

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use termgui::Engine;

const INNER: &str = "TERMGUI_TTY_INNER";

fn inner_run() -> bool {
    std::env::var_os(INNER).is_some()
}

/// Run test `name` of this binary under a pseudo-terminal, feeding `input`.
/// Returns its output, or `None` if `script` is unavailable.
fn run_under_terminal(name: &str, input: &str) -> Option<String> {
    let exe = std::env::current_exe().unwrap();
    let inner = format!(
        "'{}' {name} --exact --nocapture --test-threads=1",
        exe.display()
    );

    let mut child = match Command::new("script")
        .args(["-q", "-e", "-c", &inner, "/dev/null"])
        .env(INNER, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            eprintln!("skipping: cannot run script: {e}");
            return None;
        }
    };

    let mut stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut out = String::new();
        let _ = stdout.read_to_string(&mut out);
        let _ = tx.send(out);
    });

    let mut stdin = child.stdin.take().unwrap();
    thread::sleep(Duration::from_millis(500));
    stdin.write_all(input.as_bytes()).unwrap();
    stdin.flush().unwrap();

    let out = match rx.recv_timeout(Duration::from_secs(20)) {
        Ok(out) => out,
        Err(_) => {
            let _ = child.kill();
            panic!("terminal run of {name} hung");
        }
    };
    drop(stdin);
    let _ = child.wait();
    Some(out)
}

#[test]
fn inherited_terminal_input_reaches_the_pipeline() {
    if inner_run() {
        let lines = Engine::default().execute("read x; echo got:$x").into_lines();
        println!("RESULT:{}", lines.join("|"));
        return;
    }

    let Some(out) = run_under_terminal("inherited_terminal_input_reaches_the_pipeline", "hello\n")
    else {
        return;
    };
    assert!(out.contains("RESULT:got:hello"), "output was: {out}");
}

#[test]
fn interrupt_frees_a_pipeline_waiting_on_the_terminal() {
    if inner_run() {
        let engine = Engine::default();
        let worker = {
            let engine = engine.clone();
            thread::spawn(move || engine.execute("read x; echo got:$x"))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.controller().running() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(300));
        engine.request_interrupt();

        let outcome = worker.join().unwrap();
        println!("RESULT:returned failure={}", outcome.is_failure());
        return;
    }

    let Some(out) = run_under_terminal("interrupt_frees_a_pipeline_waiting_on_the_terminal", "")
    else {
        return;
    };
    assert!(out.contains("RESULT:returned failure=true"), "output was: {out}");
}
