#![cfg(unix)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use hearth::config::InstanceConfig;
use hearth::instance::{
    decode_args, elect, elect_with, Delivery, HandlerTable, Role, RUN_EVENT, SHUTDOWN_EVENT,
};

fn config(dir: &Path) -> InstanceConfig {
    InstanceConfig {
        lock_path: dir.join("hearth.lock"),
        pipe_path: dir.join("hearth.pipe"),
        poll_interval_ms: 5,
    }
}

fn recording_handlers() -> (HandlerTable, Receiver<(String, Vec<String>)>) {
    let (sender, receiver) = unbounded();
    let run = sender.clone();
    let handlers = HandlerTable::new()
        .on(RUN_EVENT, move |payload| {
            let _ = run.send((RUN_EVENT.to_string(), decode_args(payload)));
        })
        .on(SHUTDOWN_EVENT, move |_| {
            let _ = sender.send((SHUTDOWN_EVENT.to_string(), Vec::new()));
        });
    (handlers, receiver)
}

#[cfg(test)]
mod election_tests {
    use super::*;

    #[test]
    fn test_exactly_one_main_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (first_handlers, _events) = recording_handlers();
        let first = elect(&config, first_handlers).unwrap();
        let (second_handlers, _) = recording_handlers();
        let second = elect(&config, second_handlers).unwrap();

        assert!(first.is_main());
        assert!(!second.is_main());
        if let Role::Main(main) = &first {
            assert!(main.pipe_path().exists());
        }
    }

    #[test]
    fn test_secondary_skips_main_only_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, _events) = recording_handlers();
        let _main = elect(&config, handlers).unwrap();

        let mut ran = false;
        let role = elect_with(&config, || {
            ran = true;
            Ok(HandlerTable::new())
        })
        .unwrap();

        assert!(!role.is_main());
        assert!(!ran);
    }

    #[test]
    fn test_racing_processes_elect_one_main() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let contenders = 8;
        let start = Arc::new(Barrier::new(contenders));

        let racers: Vec<_> = (0..contenders)
            .map(|_| {
                let config = config.clone();
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    let (handlers, _events) = recording_handlers();
                    start.wait();
                    elect(&config, handlers).unwrap()
                })
            })
            .collect();
        let roles: Vec<Role> = racers.into_iter().map(|racer| racer.join().unwrap()).collect();

        assert_eq!(roles.iter().filter(|role| role.is_main()).count(), 1);
        assert_eq!(roles.len(), contenders);
    }

    #[test]
    fn test_lock_is_released_with_main() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (handlers, _events) = recording_handlers();
        let main = elect(&config, handlers).unwrap();
        drop(main);
        assert!(!config.pipe_path.exists());

        let (handlers, _events) = recording_handlers();
        assert!(elect(&config, handlers).unwrap().is_main());
    }
}

#[cfg(test)]
mod forwarding_tests {
    use super::*;

    fn secondary(role: Role) -> hearth::instance::SecondaryInstance {
        match role {
            Role::Secondary(secondary) => secondary,
            Role::Main(_) => panic!("expected a secondary instance"),
        }
    }

    #[test]
    fn test_forwarded_command_is_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, events) = recording_handlers();
        let _main = elect(&config, handlers).unwrap();
        let forwarder = secondary(elect(&config, HandlerTable::new()).unwrap());

        let argv = vec!["bench".to_string(), "--fast".to_string()];
        assert_eq!(forwarder.forward_command(&argv).unwrap(), Delivery::Delivered);

        let (event, received) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, RUN_EVENT);
        assert_eq!(received, argv);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_frames_from_successive_sends_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, events) = recording_handlers();
        let _main = elect(&config, handlers).unwrap();
        let forwarder = secondary(elect(&config, HandlerTable::new()).unwrap());

        forwarder.forward_command(&["one".to_string()]).unwrap();
        let (_, first) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        forwarder.request_shutdown().unwrap();
        let (second, _) = events.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(first, vec!["one".to_string()]);
        assert_eq!(second, SHUTDOWN_EVENT);
    }

    #[test]
    fn test_back_to_back_sends_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, events) = recording_handlers();
        let _main = elect(&config, handlers).unwrap();
        let forwarder = secondary(elect(&config, HandlerTable::new()).unwrap());

        let bench = vec!["bench".to_string(), "--fast".to_string()];
        let other = vec!["other".to_string()];
        assert_eq!(forwarder.forward_command(&bench).unwrap(), Delivery::Delivered);
        assert_eq!(forwarder.forward_command(&other).unwrap(), Delivery::Delivered);

        let (_, first) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        let (_, second) = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, bench);
        assert_eq!(second, other);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_concurrent_senders_deliver_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, events) = recording_handlers();
        let _main = elect(&config, handlers).unwrap();
        let senders = 6;
        let start = Arc::new(Barrier::new(senders));

        let workers: Vec<_> = (0..senders)
            .map(|i| {
                let forwarder = secondary(elect(&config, HandlerTable::new()).unwrap());
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let argv = vec![format!("task-{i}"), "--id".to_string(), i.to_string()];
                    forwarder.forward_command(&argv).unwrap()
                })
            })
            .collect();
        for worker in workers {
            assert_eq!(worker.join().unwrap(), Delivery::Delivered);
        }

        let received: BTreeSet<Vec<String>> = (0..senders)
            .map(|_| events.recv_timeout(Duration::from_secs(5)).unwrap().1)
            .collect();
        let expected: BTreeSet<Vec<String>> = (0..senders)
            .map(|i| vec![format!("task-{i}"), "--id".to_string(), i.to_string()])
            .collect();
        assert_eq!(received, expected);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_send_after_main_exits_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (handlers, _events) = recording_handlers();
        let main = elect(&config, handlers).unwrap();
        let forwarder = secondary(elect(&config, HandlerTable::new()).unwrap());
        drop(main);

        assert_eq!(
            forwarder.forward_command(&["late".to_string()]).unwrap(),
            Delivery::Dropped
        );
    }
}
