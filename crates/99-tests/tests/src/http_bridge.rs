//! Compute threads pulling HTTP bodies through the task broker.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::thread;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::{FutureExt, LocalBoxFuture};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use task_broker::{
    BrokerConfig, BrokerError, BrokerHandle, BrokerIoError, FetchResponse, Fetcher, HttpRequest,
    TaskBroker,
};
use zap_buffers::NativeExecutor;

type Chunk = Result<Vec<u8>, BrokerIoError>;

/// Fixed bodies plus one live body the test feeds by hand.
struct TableFetcher {
    bodies: HashMap<String, Vec<u8>>,
    live: Arc<Mutex<Option<UnboundedReceiver<Chunk>>>>,
}

const LIVE_URL: &str = "https://files.test/live";

impl Fetcher for TableFetcher {
    fn fetch(
        &self,
        request: HttpRequest,
    ) -> LocalBoxFuture<'static, Result<FetchResponse, BrokerIoError>> {
        let response = if request.url == LIVE_URL {
            self.live
                .lock()
                .take()
                .map(|body| FetchResponse::new(200, body.boxed_local()))
        } else {
            self.bodies.get(&request.url).map(|body| {
                let chunks: Vec<Chunk> = body.chunks(7).map(|c| Ok(c.to_vec())).collect();
                FetchResponse::new(200, stream::iter(chunks).boxed_local())
            })
        };
        let response =
            response.unwrap_or_else(|| FetchResponse::new(404, stream::empty().boxed_local()));
        async move { Ok(response) }.boxed_local()
    }
}

fn file_body(i: usize) -> Vec<u8> {
    format!("file {i} ").repeat(40).into_bytes()
}

fn start(config: BrokerConfig) -> (Arc<NativeExecutor>, BrokerHandle, UnboundedSender<Chunk>) {
    let exec = Arc::new(NativeExecutor::new(1 << 20).expect("executor"));
    let (tx, rx) = unbounded();
    let live = Arc::new(Mutex::new(Some(rx)));
    let broker = TaskBroker::spawn(exec.clone(), config, move || TableFetcher {
        bodies: (0..8)
            .map(|i| (format!("https://files.test/{i}"), file_body(i)))
            .collect(),
        live,
    })
    .expect("spawn broker");
    (exec, broker, tx)
}

#[test]
fn back_to_back_reads_fail_with_multiple_pending_reads() {
    let (_exec, broker, tx) = start(BrokerConfig::default());
    let client = broker.client();
    let stream = client
        .open_stream(&HttpRequest::get(LIVE_URL))
        .expect("open live stream");

    let first = stream.begin_read(20).expect("first read");
    let second = stream.begin_read(20).expect("second read");
    assert!(matches!(
        second.wait(),
        Err(BrokerError::MultiplePendingReads)
    ));

    tx.unbounded_send(Ok(b"late bytes".to_vec())).expect("feed");
    assert_eq!(first.wait().expect("first"), b"late bytes".to_vec());
    drop(tx);
    drop(stream);
    broker.shutdown().expect("shutdown");
}

#[test]
fn a_tiny_control_ring_still_serves_every_thread() {
    let config = BrokerConfig {
        control_bytes: 20,
        ..BrokerConfig::default()
    };
    let (exec, broker, _tx) = start(config);
    let client = broker.client();
    assert_eq!(client.control_capacity(), 2);

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let mut stream = client
                    .open_stream(&HttpRequest::get(format!("https://files.test/{i}")))
                    .expect("open");
                let mut body = Vec::new();
                stream.read_to_end(&mut body).expect("read");
                body
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().expect("worker"), file_body(i));
    }

    let missing = client.open_stream(&HttpRequest::get("https://files.test/none"));
    assert!(matches!(missing, Err(BrokerError::Io(_))));

    broker.shutdown().expect("shutdown");
    assert_eq!(exec.live_allocations(), 0);
}
