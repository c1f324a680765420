use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::{FutureExt, LocalBoxFuture};
use futures::StreamExt;
use parking_lot::Mutex;
use task_broker::{
    BrokerConfig, BrokerError, BrokerHandle, BrokerIoError, FetchResponse, Fetcher, HttpRequest,
    TaskBroker, TaskClient,
};
use transport::ControlRegion;
use zap_buffers::NativeExecutor;

type Chunk = Result<Vec<u8>, BrokerIoError>;

enum Route {
    Respond {
        status: u16,
        body: futures::channel::mpsc::UnboundedReceiver<Chunk>,
    },
    Fail(&'static str),
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// Serves each URL once from a channel the test feeds.
struct ChannelFetcher {
    routes: Routes,
}

impl Fetcher for ChannelFetcher {
    fn fetch(
        &self,
        request: HttpRequest,
    ) -> LocalBoxFuture<'static, Result<FetchResponse, BrokerIoError>> {
        let route = self.routes.lock().remove(&request.url);
        async move {
            match route {
                Some(Route::Respond { status, body }) => {
                    Ok(FetchResponse::new(status, body.boxed_local()))
                }
                Some(Route::Fail(reason)) => Err(BrokerIoError::new(reason)),
                None => Err(BrokerIoError::new(format!("no route for {}", request.url))),
            }
        }
        .boxed_local()
    }
}

struct Harness {
    exec: Arc<NativeExecutor>,
    routes: Routes,
    broker: BrokerHandle,
    client: TaskClient,
}

impl Harness {
    fn start() -> Self {
        let exec = Arc::new(NativeExecutor::new(1 << 20).expect("executor"));
        let routes: Routes = Arc::default();
        let fetcher_routes = Arc::clone(&routes);
        let broker = TaskBroker::spawn(exec.clone(), BrokerConfig::default(), move || {
            ChannelFetcher {
                routes: fetcher_routes,
            }
        })
        .expect("spawn broker");
        let client = broker.client();
        Self {
            exec,
            routes,
            broker,
            client,
        }
    }

    fn route(&self, url: &str, status: u16) -> UnboundedSender<Chunk> {
        let (tx, rx) = unbounded();
        self.routes
            .lock()
            .insert(url.to_string(), Route::Respond { status, body: rx });
        tx
    }

    fn fail(&self, url: &str, reason: &'static str) {
        self.routes.lock().insert(url.to_string(), Route::Fail(reason));
    }
}

fn send(tx: &UnboundedSender<Chunk>, bytes: &[u8]) {
    tx.unbounded_send(Ok(bytes.to_vec())).expect("feed");
}

#[test]
fn blocking_reads_return_available_bytes_then_eof() {
    let h = Harness::start();
    let tx = h.route("https://host/data", 200);
    let stream = h
        .client
        .open_stream(&HttpRequest::get("https://host/data"))
        .expect("open");
    assert_eq!(stream.id(), 1);

    let mut buf = [0u8; 20];
    send(&tx, &[1; 12]);
    assert_eq!(h.client.read(stream.id(), &mut buf).expect("read"), 12);
    assert_eq!(&buf[..12], &[1; 12]);

    send(&tx, &[2; 30]);
    assert_eq!(h.client.read(stream.id(), &mut buf).expect("read"), 20);
    assert_eq!(h.client.read(stream.id(), &mut buf).expect("read"), 10);

    drop(tx);
    assert_eq!(h.client.read(stream.id(), &mut buf).expect("eof"), 0);
    assert_eq!(h.client.read(stream.id(), &mut buf).expect("eof again"), 0);

    stream.close().expect("close");
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn body_errors_surface_as_io_errors() {
    let h = Harness::start();
    let tx = h.route("https://host/flaky", 200);
    let mut stream = h
        .client
        .open_stream(&HttpRequest::get("https://host/flaky"))
        .expect("open");

    let mut buf = [0u8; 8];
    send(&tx, b"ok");
    assert_eq!(stream.read(&mut buf).expect("read"), 2);

    tx.unbounded_send(Err(BrokerIoError::new("connection reset")))
        .expect("feed");
    let err = h.client.read(stream.id(), &mut buf).unwrap_err();
    assert!(matches!(err, BrokerError::Io(_)), "{err}");

    let io_err = stream.read(&mut buf).unwrap_err();
    assert_eq!(io_err.kind(), std::io::ErrorKind::Other);
    drop(stream);
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn failed_opens_are_io_errors() {
    let h = Harness::start();
    let _tx = h.route("https://host/missing", 404);
    h.fail("https://host/refused", "connection refused");

    for url in ["https://host/missing", "https://host/refused", "https://host/unrouted"] {
        let err = h.client.open_stream(&HttpRequest::get(url)).unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)), "{url}: {err}");
    }
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn second_pending_read_is_refused() {
    let h = Harness::start();
    let tx = h.route("https://host/slow", 200);
    let stream = h
        .client
        .open_stream(&HttpRequest::get("https://host/slow"))
        .expect("open");

    let first = stream.begin_read(8).expect("first read");
    let second = stream.begin_read(8).expect("second read");
    let err = second.wait().unwrap_err();
    assert!(matches!(err, BrokerError::MultiplePendingReads), "{err}");
    assert!(err.is_ownership_violation());

    send(&tx, b"payload!");
    assert_eq!(first.wait().expect("first answered"), b"payload!".to_vec());
    drop(stream);
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn unknown_and_closed_streams_are_rejected() {
    let h = Harness::start();
    let mut buf = [0u8; 4];
    assert!(matches!(
        h.client.read(999, &mut buf),
        Err(BrokerError::UnknownStream)
    ));
    assert!(matches!(
        h.client.close_stream(999),
        Err(BrokerError::UnknownStream)
    ));

    let _tx = h.route("https://host/idle", 200);
    let stream = h
        .client
        .open_stream(&HttpRequest::get("https://host/idle"))
        .expect("open");
    let id = stream.id();
    let pending = stream.begin_read(4).expect("read");
    h.client.close_stream(id).expect("close");
    assert!(matches!(pending.wait(), Err(BrokerError::UnknownStream)));
    assert!(matches!(
        h.client.read(id, &mut buf),
        Err(BrokerError::UnknownStream)
    ));
    // Already closed; the drop-time close is answered as unknown and ignored.
    drop(stream);
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn streams_read_to_end_and_free_everything() {
    let h = Harness::start();
    let tx = h.route("https://host/file", 200);
    let mut stream = h
        .client
        .open_stream(
            &HttpRequest::new("POST", "https://host/file")
                .header("accept", "application/octet-stream")
                .body(&b"query"[..]),
        )
        .expect("open");

    let expected: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    for chunk in expected.chunks(97) {
        send(&tx, chunk);
    }
    drop(tx);

    let mut body = Vec::new();
    stream.read_to_end(&mut body).expect("read to end");
    assert_eq!(body, expected);
    drop(stream);

    let exec = Arc::clone(&h.exec);
    h.broker.shutdown().expect("shutdown");
    assert_eq!(exec.live_allocations(), 0);
}

#[test]
fn compute_threads_share_one_broker() {
    let h = Harness::start();
    let feeds: Vec<_> = (0..4)
        .map(|i| {
            let tx = h.route(&format!("https://host/part/{i}"), 200);
            send(&tx, &[i as u8; 50]);
            send(&tx, &[i as u8; 25]);
            tx
        })
        .collect();
    drop(feeds);

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let client = h.client.clone();
            thread::spawn(move || {
                let mut stream = client
                    .open_stream(&HttpRequest::get(format!("https://host/part/{i}")))
                    .expect("open");
                let mut body = Vec::new();
                stream.read_to_end(&mut body).expect("read");
                body
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().expect("worker"), vec![i as u8; 75]);
    }
    h.broker.shutdown().expect("shutdown");
}

#[test]
fn shutdown_fails_pending_reads_and_later_requests() {
    let h = Harness::start();
    let _tx = h.route("https://host/forever", 200);
    let stream = h
        .client
        .open_stream(&HttpRequest::get("https://host/forever"))
        .expect("open");
    let pending = stream.begin_read(16).expect("read");

    h.client.shutdown().expect("shutdown");
    assert!(matches!(pending.wait(), Err(BrokerError::Io(_))));
    assert!(matches!(
        h.client.open_stream(&HttpRequest::get("https://host/forever")),
        Err(BrokerError::ShutDown)
    ));
    assert!(matches!(h.client.shutdown(), Err(BrokerError::ShutDown)));
    drop(stream);
    h.broker.join().expect("join");
}

#[test]
fn requests_after_another_client_shut_the_broker_down_fail_fast() {
    let exec = Arc::new(NativeExecutor::new(1 << 16).expect("executor"));
    let control = Arc::new(ControlRegion::with_capacity(8).expect("control"));
    let broker = {
        let exec = exec.clone();
        let control = Arc::clone(&control);
        thread::spawn(move || {
            let fetcher: Rc<dyn Fetcher> = Rc::new(ChannelFetcher {
                routes: Arc::default(),
            });
            TaskBroker::new(exec, control, fetcher, BrokerConfig::default()).run();
        })
    };
    let first = TaskClient::new(exec.clone(), Arc::clone(&control));
    let second = TaskClient::new(exec.clone(), Arc::clone(&control));

    first.shutdown().expect("shutdown");
    broker.join().expect("broker thread");
    assert!(control.is_closed());

    let late = thread::spawn(move || {
        let outcome = second.close_stream(1);
        (outcome, second.is_shut_down())
    });
    let (outcome, shut_down) = late.join().expect("late requester");
    assert!(matches!(outcome, Err(BrokerError::ShutDown)));
    assert!(shut_down);
    assert_eq!(exec.live_allocations(), 0);
}
