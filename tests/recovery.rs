use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ackq::core::{read_metadata, write_metadata, ManualClock, TopicsMeta};
use ackq::{QueueConfig, QueueStats, Registry};
use tempfile::tempdir;

fn config(dir: &Path) -> QueueConfig {
    let mut config = QueueConfig::new(dir);
    config.visibility_timeout_ms = 1_000;
    config.scan_interval_ms = 60_000;
    config.scan_refresh_interval_ms = 60_000;
    config
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn topics_survive_restart() {
    let dir = tempdir().expect("tempdir");
    {
        let registry = Registry::open(config(dir.path())).expect("open");
        registry.push("alpha", b"a").expect("push");
        registry.push("beta", b"b").expect("push");
        registry.get_or_create_topic("gamma").expect("create");
        registry.exit();
    }

    let meta = read_metadata(&dir.path().join("topics.json")).expect("read metadata");
    assert_eq!(meta.names().collect::<Vec<_>>(), vec!["alpha", "beta", "gamma"]);

    let registry = Registry::open(config(dir.path())).expect("reopen");
    assert_eq!(registry.topic_names(), vec!["alpha", "beta", "gamma"]);
    for name in ["alpha", "beta", "gamma"] {
        assert!(registry.topic(name).expect("loaded").is_running());
    }
    assert_eq!(registry.pop("alpha").expect("pop").payload, b"a");
    assert!(registry.pop("gamma").expect_err("empty").is_empty_queue());
    registry.push("gamma", b"g").expect("push after restart");
}

#[test]
fn ids_keep_increasing_across_restart_and_purge() {
    let dir = tempdir().expect("tempdir");
    let last = {
        let registry = Registry::open(config(dir.path())).expect("open");
        registry.push("t", b"a").expect("push");
        let last = registry.push("t", b"b").expect("push");
        registry.remove_all("t").expect("purge");
        last
    };

    let registry = Registry::open(config(dir.path())).expect("reopen");
    assert_eq!(registry.stats("t").expect("stats"), QueueStats::default());
    assert!(registry.push("t", b"c").expect("push") > last);
}

#[test]
fn in_flight_entries_survive_restart_and_expire() {
    let dir = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000_000_000));
    let id = {
        let registry =
            Registry::open_with_clock(config(dir.path()), clock.clone()).expect("open");
        let id = registry.push("t", b"work").expect("push");
        assert_eq!(registry.pop("t").expect("pop").id, id);
        id
    };

    let registry = Registry::open_with_clock(config(dir.path()), clock.clone()).expect("reopen");
    assert_eq!(
        registry.stats("t").expect("stats"),
        QueueStats {
            ready: 0,
            in_flight: 1
        }
    );
    clock.advance(Duration::from_secs(1));
    assert_eq!(registry.scan_all(), 1);
    assert_eq!(registry.pop("t").expect("redelivery").id, id);
}

#[test]
fn new_topics_are_persisted_in_the_background() {
    let dir = tempdir().expect("tempdir");
    let registry = Registry::open(config(dir.path())).expect("open");
    let path = dir.path().join("topics.json");

    registry.push("fresh", b"x").expect("push");
    wait_for("topics file", || {
        read_metadata(&path)
            .map(|meta| meta.names().any(|name| name == "fresh"))
            .unwrap_or(false)
    });
}

#[test]
fn unreadable_metadata_starts_empty() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("topics.json"), b"{broken").expect("write");

    let registry = Registry::open(config(dir.path())).expect("open despite bad metadata");
    assert!(registry.topic_names().is_empty());
    registry.push("t", b"x").expect("push");
}

#[test]
fn load_metadata_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    write_metadata(
        &dir.path().join("topics.json"),
        &TopicsMeta::from_names(["a", "b"]),
    )
    .expect("seed metadata");

    let registry = Registry::open(config(dir.path())).expect("open");
    registry.push("a", b"x").expect("push");
    assert_eq!(registry.load_metadata().expect("reload"), 2);
    assert_eq!(registry.topic_names(), vec!["a", "b"]);
    assert_eq!(registry.stats("a").expect("stats").ready, 1);
}

#[test]
fn removed_topic_is_gone_after_restart() {
    let dir = tempdir().expect("tempdir");
    {
        let registry = Registry::open(config(dir.path())).expect("open");
        registry.push("keep", b"k").expect("push");
        registry.push("drop", b"d").expect("push");
        registry.pop("drop").expect("pop");
        assert!(registry.remove_topic("drop").expect("remove"));
        assert!(!registry.remove_topic("drop").expect("remove twice"));
        assert!(registry.topic("drop").is_none());
    }

    let registry = Registry::open(config(dir.path())).expect("reopen");
    assert_eq!(registry.topic_names(), vec!["keep"]);
    assert_eq!(registry.stats("drop").expect("stats"), QueueStats::default());
    assert_eq!(registry.push("drop", b"again").expect("push"), 1);
}

#[test]
fn remove_topic_never_drops_pushes_that_recreate_it() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.sync_writes = false;
    let registry = Arc::new(Registry::open(config).expect("open"));

    for round in 0..200 {
        let name = format!("t{round}");
        registry.push(&name, b"seed").expect("seed push");

        let remover = {
            let registry = Arc::clone(&registry);
            let name = name.clone();
            thread::spawn(move || registry.remove_topic(&name).expect("remove"))
        };
        let pusher = {
            let registry = Arc::clone(&registry);
            let name = name.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|i| registry.push(&name, format!("{i}").as_bytes()).expect("push"))
                    .collect::<Vec<u64>>()
            })
        };
        assert!(remover.join().expect("remover"));
        let accepted = pusher.join().expect("pusher");
        assert_eq!(accepted.len(), 50);

        // Pushes that landed after the removal recreated the topic and must
        // all still be there.
        if registry.topic(&name).is_some() {
            let stored = registry.stats(&name).expect("stats").ready;
            assert!(stored >= 1, "round {round}: recreated topic lost its entries");
            let mut redelivered = Vec::new();
            while let Ok(delivery) = registry.pop(&name) {
                redelivered.push(delivery.id);
            }
            assert_eq!(redelivered.len() as u64, stored);
            let tail = &accepted[accepted.len() - redelivered.len()..];
            assert_eq!(redelivered, tail, "round {round}: stored ids are not the last pushes");
        }
    }
}

#[test]
fn exit_racing_topic_creation_leaves_nothing_running() {
    let dir = tempdir().expect("tempdir");
    let registry = Arc::new(Registry::open(config(dir.path())).expect("open"));

    let creators: Vec<_> = (0..4)
        .map(|c| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut created = Vec::new();
                for i in 0..200 {
                    match registry.get_or_create_topic(&format!("c{c}-{i}")) {
                        Ok(topic) => created.push(topic),
                        Err(err) if err.is_closed() => break,
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
                created
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    registry.exit();
    let created: Vec<_> = creators
        .into_iter()
        .flat_map(|c| c.join().expect("creator"))
        .collect();

    assert!(created.iter().all(|topic| !topic.is_running()));
    let persisted: Vec<String> = read_metadata(&dir.path().join("topics.json"))
        .expect("read metadata")
        .names()
        .map(str::to_string)
        .collect();
    for topic in &created {
        assert!(persisted.iter().any(|name| name == topic.name()));
    }
}

#[test]
fn exit_is_one_shot_and_closes_everything() {
    let dir = tempdir().expect("tempdir");
    let registry = Registry::open(config(dir.path())).expect("open");
    registry.push("t", b"x").expect("push");
    let topic = registry.topic("t").expect("topic");

    registry.exit();
    registry.exit();

    assert!(registry.is_exiting());
    assert!(!topic.is_running());
    assert!(registry.push("t", b"y").expect_err("closed").is_closed());
    assert!(registry.pop("t").expect_err("closed").is_closed());
    assert!(registry.push("other", b"y").expect_err("closed").is_closed());
    assert_eq!(registry.scan_stats().pool_size, 0);
}

#[test]
fn exit_races_with_producers() {
    let dir = tempdir().expect("tempdir");
    let registry = Arc::new(Registry::open(config(dir.path())).expect("open"));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut accepted = 0u64;
                for i in 0..500 {
                    match registry.push(&format!("t{p}"), format!("{i}").as_bytes()) {
                        Ok(_) => accepted += 1,
                        Err(err) if err.is_closed() => break,
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
                accepted
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(10));
    registry.exit();
    for producer in producers {
        producer.join().expect("producer");
    }
}
