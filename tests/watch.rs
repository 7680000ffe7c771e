use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use termgui::pipeline::FirstInput;
use termgui::watch::DIVIDER;
use termgui::{Engine, EngineConfig, WatchEvent, WatchMessage, WatchQueue};

fn engine() -> Engine {
    Engine::new(EngineConfig {
        first_input: FirstInput::Null,
        poll_interval: Duration::from_millis(20),
        watch_interval: Duration::from_millis(100),
        watch_grace: Duration::from_millis(200),
        ..EngineConfig::default()
    })
}

fn commands(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

/// Drain `queue` until `done` accepts what has arrived so far.
fn drain_until(
    queue: &WatchQueue,
    seen: &mut Vec<WatchMessage>,
    done: impl Fn(&[WatchMessage]) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(seen) {
        assert!(Instant::now() < deadline, "timed out; saw {seen:?}");
        seen.extend(queue.drain());
        thread::sleep(Duration::from_millis(10));
    }
}

fn cycles(seen: &[WatchMessage]) -> Vec<&Vec<String>> {
    seen.iter()
        .filter_map(|m| match &m.event {
            WatchEvent::Cycle(lines) => Some(lines),
            _ => None,
        })
        .collect()
}

fn stopped(seen: &[WatchMessage]) -> bool {
    seen.iter()
        .any(|m| matches!(m.event, WatchEvent::Stopped { .. }))
}

#[test]
fn each_cycle_lists_commands_in_order() {
    let engine = engine();
    let queue = WatchQueue::new();
    let handle = engine
        .start_watch(
            commands(&["echo a", "echo b"]),
            9,
            vec!["prior".into()],
            None,
            queue.clone(),
        )
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| cycles(seen).len() >= 2);
    handle.stop();
    drain_until(&queue, &mut seen, stopped);

    assert!(seen.iter().all(|m| m.session == 9));
    assert!(matches!(&seen[0].event, WatchEvent::Banner(text) if text.starts_with("multiWatch: 2 command(s)")));

    for cycle in cycles(&seen) {
        assert_eq!(cycle.len(), 8, "{cycle:?}");
        let headers: Vec<_> = cycle.iter().filter(|l| l.starts_with("$ ")).collect();
        assert_eq!(headers.len(), 2);
        assert!(cycle[0].starts_with("$ echo a  ["), "{}", cycle[0]);
        assert_eq!(cycle[1], DIVIDER);
        assert_eq!(cycle[2], "a");
        assert_eq!(cycle[3], DIVIDER);
        assert!(cycle[4].starts_with("$ echo b  ["), "{}", cycle[4]);
        assert_eq!(cycle[6], "b");
        assert_eq!(cycle[7], DIVIDER);
    }

    match &seen.last().unwrap().event {
        WatchEvent::Stopped { scrollback } => assert_eq!(scrollback, &["prior".to_string()]),
        other => panic!("last event was {other:?}"),
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_done() {
        assert!(Instant::now() < deadline, "done flag never set");
        thread::sleep(Duration::from_millis(10));
    }
    handle.join();
}

#[test]
fn failing_command_is_marked_inside_its_block() {
    let engine = engine();
    let queue = WatchQueue::new();
    let handle = engine
        .start_watch(commands(&["exit 3"]), 1, Vec::new(), None, queue.clone())
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| !cycles(seen).is_empty());
    handle.join();

    let first = cycles(&seen)[0].clone();
    assert_eq!(first[2], "ERROR: (process exited with code 3)");
}

#[test]
fn commands_run_in_the_session_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("watched.txt"), "").unwrap();
    let engine = engine();
    let queue = WatchQueue::new();
    let handle = engine
        .start_watch(
            commands(&["ls"]),
            1,
            Vec::new(),
            Some(dir.path().to_path_buf()),
            queue.clone(),
        )
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| !cycles(seen).is_empty());
    handle.join();

    assert_eq!(cycles(&seen)[0][2], "watched.txt");
}

#[test]
fn stop_interrupts_a_running_cycle() {
    let engine = engine();
    let queue = WatchQueue::new();
    let handle = engine
        .start_watch(commands(&["sleep 30"]), 4, vec!["kept".into()], None, queue.clone())
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| !seen.is_empty());
    thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        handle.join();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("watch did not stop");

    seen.extend(queue.drain());
    assert!(cycles(&seen).is_empty(), "{seen:?}");
    assert!(stopped(&seen));
}

#[test]
fn stop_escalates_when_interrupt_is_ignored() {
    let engine = engine();
    let queue = WatchQueue::new();
    let handle = engine
        .start_watch(
            commands(&["trap '' INT; sleep 30"]),
            5,
            Vec::new(),
            None,
            queue.clone(),
        )
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| !seen.is_empty());
    thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        handle.join();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("watch did not stop");

    seen.extend(queue.drain());
    assert!(stopped(&seen));
}

#[test]
fn sessions_publish_under_their_own_id() {
    let engine = engine();
    let queue = WatchQueue::new();
    let first = engine
        .start_watch(commands(&["echo one"]), 1, Vec::new(), None, queue.clone())
        .unwrap();
    let second = engine
        .start_watch(commands(&["echo two"]), 2, Vec::new(), None, queue.clone())
        .unwrap();

    let mut seen = Vec::new();
    drain_until(&queue, &mut seen, |seen| {
        [1, 2].iter().all(|id| {
            seen.iter()
                .any(|m| m.session == *id && matches!(m.event, WatchEvent::Cycle(_)))
        })
    });
    first.join();
    second.join();
    seen.extend(queue.drain());

    for message in &seen {
        if let WatchEvent::Cycle(lines) = &message.event {
            let expected = if message.session == 1 { "one" } else { "two" };
            assert_eq!(lines[2], expected);
        }
    }
}
