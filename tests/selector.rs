use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use pollframe::selector::{Direction, Selector, SelectorConfig};
use pollframe::Error;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_all_resume() {
    let selector = Selector::new(SelectorConfig::default()).unwrap();

    // Let the loop block in its wait before anything is registered
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pairs: Vec<(UnixStream, UnixStream)> =
        (0..16).map(|_| UnixStream::pair().unwrap()).collect();

    let mut waiters = Vec::new();
    for (local, _) in &pairs {
        let handle = selector.handle();
        let fd = local.as_raw_fd();
        waiters.push(tokio::spawn(async move {
            handle
                .register_interest(fd, Direction::Read)
                .unwrap()
                .await
        }));
    }

    // Give every task a chance to queue its registration
    tokio::time::sleep(Duration::from_millis(20)).await;
    for (_, remote) in &pairs {
        (&*remote).write_all(b"!").unwrap();
    }

    for waiter in waiters {
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("registration resumed")
            .unwrap();
        assert!(outcome.is_ok());
    }
    assert_eq!(selector.handle().pending_count(), 0);
}

#[tokio::test]
async fn writable_socket_resumes_immediately() {
    let selector = Selector::new(SelectorConfig::default()).unwrap();
    let (local, _remote) = UnixStream::pair().unwrap();

    let readiness = selector
        .register_interest(local.as_raw_fd(), Direction::Write)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), readiness)
        .await
        .expect("writable")
        .unwrap();
}

#[test]
fn dropped_readiness_clears_interest() {
    let (handle, mut selector_loop) = Selector::manual(SelectorConfig::default()).unwrap();
    let (local, mut remote) = UnixStream::pair().unwrap();
    let fd = local.as_raw_fd();

    let readiness = handle.register_interest(fd, Direction::Read).unwrap();
    drop(readiness);
    selector_loop.poll(Some(Duration::ZERO)).unwrap();
    assert_eq!(handle.pending_count(), 0);

    // Nothing is waiting, so readiness resumes nobody
    remote.write_all(b"x").unwrap();
    let resumed = selector_loop
        .poll(Some(Duration::from_millis(20)))
        .unwrap();
    assert_eq!(resumed, 0);

    // The slot is free again
    let _readiness = handle.register_interest(fd, Direction::Read).unwrap();
    let mut resumed = 0;
    for _ in 0..10 {
        resumed += selector_loop
            .poll(Some(Duration::from_millis(50)))
            .unwrap();
        if resumed > 0 {
            break;
        }
    }
    assert_eq!(resumed, 1);
    assert_eq!(handle.pending_count(), 0);
}

#[tokio::test]
async fn close_is_idempotent_and_fails_waiters() {
    let mut selector = Selector::new(SelectorConfig::default()).unwrap();
    let (local, _remote) = UnixStream::pair().unwrap();

    let readiness = selector
        .register_interest(local.as_raw_fd(), Direction::Read)
        .unwrap();

    selector.close();
    selector.close();

    assert!(matches!(readiness.await, Err(Error::SelectorClosed)));
    assert!(matches!(
        selector.register_interest(local.as_raw_fd(), Direction::Read),
        Err(Error::SelectorClosed)
    ));
}

#[test]
fn selector_thread_is_named() {
    let config = SelectorConfig::builder().thread_name("io-loop").build();
    let selector = Selector::new(config).unwrap();
    assert!(!selector.is_closed());
    drop(selector);
}
