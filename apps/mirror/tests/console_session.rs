use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use mirror_cli::app::{SourceRun, run_source, run_viewer};
use mirror_cli::console::{ConsoleReplayer, LineRecorder, LoggingSink};
use mirror_proto::{Role, SessionId};
use mirror_session::SourceOptions;
use mirror_transport::{MemoryHub, PeerTransport, TransportConfig};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn transport(hub: &MemoryHub, session: &SessionId, role: Role) -> Arc<PeerTransport> {
    let link = hub.bind(session.address(role)).expect("bind");
    Arc::new(
        PeerTransport::bind(session.clone(), role, Arc::new(link), TransportConfig::default())
            .expect("transport"),
    )
}

struct Peer {
    input: DuplexStream,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Peer {
    async fn type_line(&mut self, line: &str) {
        self.input.write_all(line.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("peer did not stop")
            .expect("peer task panicked")
            .expect("peer failed");
    }
}

fn spawn_source(
    transport: Arc<PeerTransport>,
    sink: Arc<LoggingSink>,
    allow_control: bool,
) -> Peer {
    let (input, reader) = tokio::io::duplex(4096);
    let (stop, stopped) = oneshot::channel();
    let run = SourceRun {
        recorder: LineRecorder::new(),
        sink,
        options: SourceOptions::default(),
        allow_control,
    };
    let task = tokio::spawn(run_source(transport, run, BufReader::new(reader), async {
        let _ = stopped.await;
    }));
    Peer { input, stop, task }
}

fn spawn_viewer(
    transport: Arc<PeerTransport>,
    replayer: Arc<ConsoleReplayer>,
    control: bool,
) -> Peer {
    let (input, reader) = tokio::io::duplex(4096);
    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(run_viewer(
        transport,
        replayer,
        control,
        BufReader::new(reader),
        async {
            let _ = stopped.await;
        },
    ));
    Peer { input, stop, task }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_viewer_sees_backlog_then_live_lines() {
    let hub = MemoryHub::new();
    let session = SessionId::new("console");
    let mut source = spawn_source(
        transport(&hub, &session, Role::Source),
        LoggingSink::new(),
        false,
    );
    source.type_line("hello").await;
    source.type_line(r#"{"n":1}"#).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let out = SharedBuf::default();
    let viewer = spawn_viewer(
        transport(&hub, &session, Role::Viewer),
        ConsoleReplayer::new(Box::new(out.clone())),
        false,
    );
    eventually(|| out.lines().len() == 2).await;

    source.type_line("live").await;
    eventually(|| out.lines().len() == 3).await;
    assert_eq!(out.lines(), vec![r#""hello""#, r#"{"n":1}"#, r#""live""#]);

    viewer.shutdown().await;
    source.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_in_control_drives_the_source_sink() {
    let hub = MemoryHub::new();
    let session = SessionId::new("console-control");
    let sink = LoggingSink::new();
    let source = spawn_source(
        transport(&hub, &session, Role::Source),
        Arc::clone(&sink),
        true,
    );

    let replayer = ConsoleReplayer::new(Box::new(SharedBuf::default()));
    let mut viewer = spawn_viewer(
        transport(&hub, &session, Role::Viewer),
        Arc::clone(&replayer),
        true,
    );
    eventually(|| replayer.is_interactive() && replayer.interactions().has_listeners()).await;

    viewer
        .type_line(r#"{"type":"click","target":4,"x":1.0,"y":2.0}"#)
        .await;
    viewer.type_line(r#"{"type":"pointer_move","x":3.0,"y":4.0}"#).await;
    eventually(|| sink.applied() == 2).await;

    viewer.shutdown().await;
    source.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_joining_late_can_still_take_control() {
    let hub = MemoryHub::new();
    let session = SessionId::new("console-late-control");
    let sink = LoggingSink::new();
    let mut source = spawn_source(
        transport(&hub, &session, Role::Source),
        Arc::clone(&sink),
        true,
    );
    source.type_line("before").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let out = SharedBuf::default();
    let replayer = ConsoleReplayer::new(Box::new(out.clone()));
    let mut viewer = spawn_viewer(
        transport(&hub, &session, Role::Viewer),
        Arc::clone(&replayer),
        true,
    );
    eventually(|| replayer.is_interactive() && replayer.interactions().has_listeners()).await;
    assert_eq!(out.lines(), vec![r#""before""#]);

    viewer.type_line(r#"{"type":"pointer_move","x":1.0,"y":1.0}"#).await;
    eventually(|| sink.applied() == 1).await;

    viewer.shutdown().await;
    source.shutdown().await;
}
