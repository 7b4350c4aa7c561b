pub mod worker;

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use mea::waitgroup::WaitGroup;
use smol::{
    Timer, future,
    net::{TcpListener, TcpStream},
};

use self::worker::ProxyWorker;
use crate::cmd::Config;
use crate::init::shutdown::StopSignal;
use crate::pool::ConnPool;
use crate::telemetry::TelemetryStore;
use crate::transform::PacketTransformer;

const EVICT_PERIOD: Duration = Duration::from_secs(1);

/// Accept loop plus the idle-eviction ticker. Each worker task carries a
/// `WaitGroup` clone; after the stop signal ends the accept loop, the
/// supervisor closes every registered client socket (failing out blocked
/// reads), waits for the group to empty, then drains the pool and flushes
/// telemetry. A bind failure surfaces as `Err` for exit code 2.
pub async fn serve(
    config: &Config,
    transformers: Vec<Box<dyn PacketTransformer>>,
    signal: &StopSignal,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("proxy listening on port [ {} ]", config.port);

    let pool = Arc::new(ConnPool::new());
    let telemetry = Arc::new(TelemetryStore::new());
    let transformers: worker::Transformers = Arc::new(transformers);
    let clients = Arc::new(ClientTable::default());
    let workers = WaitGroup::new();

    {
        let pool = pool.clone();
        let signal = signal.clone();
        smol::spawn(async move {
            loop {
                let tick = async {
                    Timer::after(EVICT_PERIOD).await;
                    true
                };
                let stop = async {
                    signal.stopped().await;
                    false
                };
                if !future::or(tick, stop).await {
                    break;
                }
                pool.evict_idle().await;
            }
        })
        .detach();
    }

    loop {
        let Some((stream, peer)) = accept_or_stop(&listener, signal).await? else {
            break;
        };

        let worker = ProxyWorker::new(
            stream.clone(),
            peer,
            pool.clone(),
            telemetry.clone(),
            transformers.clone(),
        );
        let id = clients.register(stream);
        let clients = clients.clone();
        let wg = workers.clone();
        smol::spawn(async move {
            let _workers = wg;
            worker.run().await;
            clients.deregister(id);
        })
        .detach();
    }

    log::info!("stopping proxy...");
    clients.shutdown_all();
    workers.await;
    log::info!("draining upstream connections...");
    pool.drain().await;
    telemetry.close_all();
    Ok(())
}

async fn accept_or_stop(
    listener: &TcpListener,
    signal: &StopSignal,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept = async { listener.accept().await.map(Some) };
    let stop = async {
        signal.stopped().await;
        Ok(None)
    };
    future::or(accept, stop).await
}

/// Live client sockets. Shutdown closes them all so workers blocked in
/// reads fail out promptly instead of running down their timeouts.
#[derive(Default)]
struct ClientTable {
    next: AtomicU64,
    streams: Mutex<HashMap<u64, TcpStream>>,
}

impl ClientTable {
    fn register(&self, stream: TcpStream) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .expect("client table lock poisoned")
            .insert(id, stream);
        id
    }

    fn deregister(&self, id: u64) {
        self.streams
            .lock()
            .expect("client table lock poisoned")
            .remove(&id);
    }

    fn shutdown_all(&self) {
        let streams = self.streams.lock().expect("client table lock poisoned");
        for stream in streams.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
