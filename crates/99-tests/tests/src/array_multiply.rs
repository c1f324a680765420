//! A renderer asks the worker to multiply a byte buffer it hands over. The
//! worker forwards the buffer into compute code through the executor and
//! sends the result back; ownership moves at every hop.

use std::sync::Arc;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use rpc::{linked_pair, Bus, Envelope, Payload, Protocol, RemoteError, Topic};
use serde::{Deserialize, Serialize};
use zap_buffers::{BufferError, BufferRegistry, Executor, NativeExecutor};
use zerde::{WireMessage, WireParam, ZerdeBuilder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Call {
    ArrayMultiply,
}

impl Topic for Call {
    fn name(&self) -> &'static str {
        match self {
            Call::ArrayMultiply => "array_multiply",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "array_multiply" => Some(Call::ArrayMultiply),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Multiply {
    factor: u8,
}

struct Renderer;

impl Protocol for Renderer {
    type Topic = Call;
    type Data = Multiply;
}

/// Compute side: multiplies the buffer in place and hands it back.
fn install_compute(exec: &Arc<NativeExecutor>, registry: BufferRegistry) {
    exec.set_call_handler(move |message: WireMessage| {
        let mut parser = message.parser()?;
        let factor = parser.parse_u32()? as u8;
        let params = parser.parse_params()?;
        let [WireParam::Buffer(descriptor)] = params.as_slice() else {
            return Err(BufferError::call("expected exactly one buffer"));
        };
        let mut buffer = registry.wrap_exclusive(*descriptor)?;
        for byte in buffer.view_mut::<u8>(None, None)?.iter_mut() {
            *byte = byte.wrapping_mul(factor);
        }
        let mut reply = ZerdeBuilder::new();
        reply.send_descriptor(&buffer.transfer()?)?;
        Ok(reply.into_message())
    });
}

/// Worker side: forwards the request into compute and relays the buffer.
fn install_worker(bus: &Bus<Renderer>, exec: Arc<NativeExecutor>) {
    bus.receive(Call::ArrayMultiply, move |payload: Payload<Renderer>| {
        let exec = Arc::clone(&exec);
        async move {
            let factor = payload
                .data
                .ok_or_else(|| RemoteError::new("TypeError", "missing factor"))?
                .factor;
            let [descriptor] = payload.transfer.as_slice() else {
                return Err(RemoteError::new("TypeError", "expected one buffer").into());
            };
            let mut call = ZerdeBuilder::new();
            call.send_u32(factor as u32)?;
            call.send_params(&[WireParam::Buffer(*descriptor)])?;
            let reply = exec.call(call.into_message())?;
            let mut parser = reply.parser()?;
            let tag = zerde::ParamType::from_tag(parser.parse_u32()?)?;
            let result = parser.parse_descriptor(tag)?;
            anyhow::Ok(Payload::empty().with_transfer(result))
        }
    })
    .expect("register array_multiply");
}

#[test]
fn array_multiply_round_trips_an_exclusive_buffer() {
    let exec = Arc::new(NativeExecutor::new(1 << 16).expect("executor"));
    let registry = BufferRegistry::new(exec.clone());
    install_compute(&exec, registry.clone());

    let (renderer_port, worker_port) = linked_pair::<Renderer>();
    let renderer = Bus::bind(renderer_port).expect("bind renderer");
    let worker = Bus::bind(worker_port).expect("bind worker");
    install_worker(&worker, exec.clone());

    let mut pool = LocalPool::new();
    for bus in [renderer.clone(), worker.clone()] {
        pool.spawner()
            .spawn_local(async move { bus.serve().await.expect("serve") })
            .expect("spawn");
    }

    let mut input = registry
        .alloc_exclusive(&[1u8, 2, 3, 4, 5, 6, 7, 8])
        .expect("alloc");
    let descriptor = input.transfer().expect("transfer");
    let request = Payload::new(Multiply { factor: 10 }).with_transfer(descriptor);

    let json = Envelope::<Renderer>::request(Call::ArrayMultiply, 0, Payload::new(Multiply { factor: 10 }))
        .to_json()
        .expect("json");
    assert_eq!(json["topic"], "array_multiply");
    assert_eq!(json["data"]["factor"], 10);

    let reply = pool
        .run_until(renderer.send(Call::ArrayMultiply, request))
        .expect("array_multiply");
    assert_eq!(reply.data, None);
    let [result] = reply.transfer.as_slice() else {
        panic!("expected one buffer, got {:?}", reply.transfer);
    };
    let output = registry.wrap(*result).expect("wrap result");
    assert_eq!(
        &*output.view::<u8>(None, None).expect("view"),
        &[10, 20, 30, 40, 50, 60, 70, 80]
    );

    let err = input.view::<u8>(None, None).unwrap_err();
    assert!(err.is_ownership_violation(), "{err}");

    drop(output);
    drop(input);
    assert_eq!(exec.live_allocations(), 0);

    renderer.close();
    worker.close();
    pool.run();
}

#[test]
fn compute_failures_reach_the_renderer_as_remote_errors() {
    let exec = Arc::new(NativeExecutor::new(1 << 16).expect("executor"));
    let (renderer_port, worker_port) = linked_pair::<Renderer>();
    let renderer = Bus::bind(renderer_port).expect("bind renderer");
    let worker = Bus::bind(worker_port).expect("bind worker");
    // No compute handler installed: the executor call itself fails.
    install_worker(&worker, exec.clone());

    let mut pool = LocalPool::new();
    for bus in [renderer.clone(), worker.clone()] {
        pool.spawner()
            .spawn_local(async move { bus.serve().await.expect("serve") })
            .expect("spawn");
    }

    let registry = BufferRegistry::new(exec.clone());
    let mut input = registry.alloc_exclusive(&[1u8; 4]).expect("alloc");
    let request = Payload::new(Multiply { factor: 2 })
        .with_transfer(input.transfer().expect("transfer"));
    let err = pool
        .run_until(renderer.send(Call::ArrayMultiply, request))
        .unwrap_err();
    let remote = err.remote().expect("remote error");
    assert_eq!(remote.name, "Error");
    assert!(remote.message.contains("handler"), "{}", remote.message);

    let missing = pool
        .run_until(renderer.send(Call::ArrayMultiply, Payload::empty()))
        .unwrap_err();
    assert_eq!(
        missing.remote().map(|r| r.name.as_str()),
        Some("TypeError")
    );

    renderer.close();
    worker.close();
    pool.run();
}
