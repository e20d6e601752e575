//! End-to-end test of the compiled binary: a supervisor forks two workers,
//! both share one listening socket, and connections round-trip through
//! whichever worker the kernel hands them to.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

const STARTUP: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_forked_workers_share_one_echo_listener() {
    let mut master = Command::new(env!("CARGO_BIN_EXE_hive"))
        .args(["--workers", "2", "--port", "0"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to launch supervisor");

    // Both workers report the SAME port: one bind, one kernel socket.
    let stdout = master.stdout.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();
    let mut port: Option<u16> = None;
    let mut announced = 0;
    while announced < 2 {
        let line = timeout(STARTUP, lines.next_line())
            .await
            .expect("timed out waiting for workers")
            .expect("supervisor stdout failed")
            .expect("supervisor exited before workers listened");
        let Some(addr) = line.split(" listening on ").nth(1) else {
            continue;
        };
        let reported: u16 = addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .expect("unparseable listening line");
        match port {
            Some(expected) => assert_eq!(reported, expected, "workers must share the socket"),
            None => port = Some(reported),
        }
        announced += 1;
    }
    let port = port.unwrap();

    // Echo round trips through the shared listener.
    for i in 0..4u8 {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload = format!("ping-{i}");
        stream.write_all(payload.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        timeout(STARTUP, stream.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(buf, payload.as_bytes());
    }

    master.start_kill().unwrap();
    let _ = master.wait().await;
}
