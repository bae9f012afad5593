//! End-to-end shell tests: a live server on an ephemeral port, driven
//! over real sockets.

use sfdb::config::Config;
use sfdb::server::{AccessKey, Lockdown, Server, Tokens};
use sfdb::storage::{Store, StoreOptions};

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

/// Spawns a server on an ephemeral port with a small flush interval and a
/// guest (blank) and admin (secret, one connection) token.
fn spawn(configure: impl FnOnce(&mut Config)) -> (tempfile::TempDir, SocketAddr) {
    let dir = tempfile::TempDir::with_prefix("sfdb").expect("tempdir failed");
    let mut config = Config::load("nonexistent-config-file").unwrap();
    config.server.cli_port = 0;
    config.server.cli_authentication_timeout = 1000;
    configure(&mut config);

    let store = Store::open(
        db_dir(&dir),
        StoreOptions { flush_interval: Duration::from_millis(25), ..StoreOptions::default() },
    )
    .unwrap();
    let tokens = Tokens {
        signature: "SFDB0001".to_string(),
        meid_version: 1,
        access_keys: HashMap::from([
            (
                "".to_string(),
                AccessKey {
                    alias: "guest".to_string(),
                    permissions: vec![],
                    max_connections: -1,
                },
            ),
            (
                "secret".to_string(),
                AccessKey {
                    alias: "admin".to_string(),
                    permissions: vec!["all".to_string()],
                    max_connections: 1,
                },
            ),
        ]),
    };
    let lockdown = Lockdown::load(
        config.server.cli_lockdown,
        config.server.max_cli_login_attempt,
        Duration::from_secs(config.server.cli_cooldown),
        dir.path().join(".lockdown"),
    );
    let server = Server::new(config, tokens, store, lockdown).unwrap();
    let addr = server.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = server.serve();
    });
    (dir, addr)
}

fn db_dir(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("db")
}

struct Client {
    reader: BufReader<TcpStream>,
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream =
            TcpStream::connect(("127.0.0.1", addr.port())).expect("connect failed");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { reader, stream }
    }

    /// Connects and switches the session into json mode.
    fn connect_json(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr);
        let envelope = client.request("@json");
        assert_eq!(envelope["status"], "mode_changed");
        client
    }

    fn send(&mut self, line: &str) {
        writeln!(self.stream, "{line}").expect("send failed");
        self.stream.flush().unwrap();
    }

    /// Reads one json envelope line. The line may carry a leading echo
    /// prompt from before the mode switch.
    fn read_json(&mut self) -> serde_json::Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read failed");
        let start = line.find('{').unwrap_or_else(|| panic!("no envelope in {line:?}"));
        serde_json::from_str(&line[start..]).expect("bad envelope")
    }

    fn request(&mut self, line: &str) -> serde_json::Value {
        self.send(line);
        self.read_json()
    }

    /// Reads raw bytes until the accumulated output contains the needle.
    fn read_until(&mut self, needle: &str) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 512];
        while !out.contains(needle) {
            let n = self.reader.read(&mut buf).expect("read failed");
            assert_ne!(n, 0, "connection closed waiting for {needle:?}, got {out:?}");
            out.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        out
    }

    /// Reads until the peer closes the connection.
    fn read_to_end(&mut self) -> String {
        let mut out = String::new();
        let _ = self.reader.read_to_string(&mut out);
        out
    }
}

/// A blank token authorizes as guest; set and get round-trip a value.
#[test]
fn auth_set_get() {
    let (_dir, addr) = spawn(|_| {});
    let mut client = Client::connect_json(addr);

    let auth = client.request("");
    assert_eq!(auth["status"], "authorized");
    assert_eq!(auth["status_code"], -2);
    assert_eq!(auth["success"], true);
    assert_eq!(auth["value"], "guest");

    let set = client.request("set k1 v1");
    assert_eq!(set["message_text"], "1 entry inserted");
    assert_eq!(set["status_code"], 0);

    let get = client.request("get k1");
    assert_eq!(get["value"], "v1");
    assert_eq!(get["action"], "get");

    let exit = client.request("exit");
    assert_eq!(exit["status"], "exit");
    assert_eq!(client.read_to_end(), "");
}

/// set --json inserts every top-level key; a multi-key get returns a map.
#[test]
fn json_objects() {
    let (_dir, addr) = spawn(|_| {});
    let mut client = Client::connect_json(addr);
    client.request("");

    let set = client.request(r#"set -j '{"a":1,"b":2}'"#);
    assert_eq!(set["message_text"], "2 entries inserted");

    let get = client.request("get a b");
    assert_eq!(get["value"], serde_json::json!({"a": 1, "b": 2}));

    let delete = client.request("delete a");
    assert_eq!(delete["message_text"], "1 item deleted");

    let get = client.request("get a");
    assert_eq!(get["status_code"], 6);
    assert_eq!(get["status"], "key_not_exist");
    assert_eq!(get["message_text"], "key doesn't exist");
}

/// Oversized input is rejected with status 9 and causes no mutation.
#[test]
fn input_size_limit() {
    let (_dir, addr) = spawn(|config| {
        config.server.cli_input_size = "10".to_string();
    });
    let mut client = Client::connect_json(addr);
    client.request("");

    // 17 bytes, over the 10-byte limit.
    let oversize = client.request("set longkey value");
    assert_eq!(oversize["status_code"], 9);
    assert_eq!(oversize["status"], "size_limit");

    // "info" fits under the limit and proves nothing was stored.
    let info = client.request("info");
    assert!(info["message_text"].as_str().unwrap().contains("storage.keys: 0"));
}

/// After the attempt limit the source IP is locked down: further attempts
/// fail identically even with a valid token, and the sidecar records the
/// subject.
#[test]
fn lockdown_by_ip() {
    let (dir, addr) = spawn(|config| {
        config.server.max_cli_login_attempt = 2;
        config.server.cli_cooldown = 60;
    });

    let mut client = Client::connect_json(addr);
    let first = client.request("wrong-token");
    assert_eq!(first["status"], "authorize_again");
    assert_eq!(first["status_code"], 2);
    let second = client.request("another-wrong-token");
    assert_eq!(second["status"], "authorize_again");
    // The session closes after exhausting its attempts.
    assert_eq!(client.read_to_end(), "");

    // A fresh connection is rejected before token validation: even the
    // valid token fails indistinguishably while the IP is locked.
    let mut client = Client::connect_json(addr);
    let locked = client.request("secret");
    assert_eq!(locked["status"], "authorize_again");

    let sidecar = std::fs::read_to_string(dir.path().join(".lockdown")).unwrap();
    assert!(sidecar.contains("127.0.0.1"));
}

/// A token at its connection cap rejects further sessions with full_room.
#[test]
fn full_room() {
    let (_dir, addr) = spawn(|_| {});
    let mut first = Client::connect_json(addr);
    assert_eq!(first.request("secret")["status"], "authorized");

    let mut second = Client::connect_json(addr);
    let rejected = second.request("secret");
    assert_eq!(rejected["status"], "full_room");
    assert_eq!(rejected["status_code"], 8);
    assert_eq!(second.read_to_end(), "");

    // The slot frees up when the first session exits.
    first.request("exit");
    assert_eq!(first.read_to_end(), "");
    std::thread::sleep(Duration::from_millis(100));
    let mut third = Client::connect_json(addr);
    assert_eq!(third.request("secret")["status"], "authorized");
}

/// Mutations written at least one flush interval ago survive a reopen.
#[test]
fn persistence_across_reopen() {
    let (dir, addr) = spawn(|_| {});
    let mut client = Client::connect_json(addr);
    client.request("");
    assert_eq!(client.request("set x hello")["status_code"], 0);

    // Give the change log a couple of flush intervals.
    std::thread::sleep(Duration::from_millis(200));

    let store = Store::open(
        db_dir(&dir),
        StoreOptions { persistent: false, ..StoreOptions::default() },
    )
    .unwrap();
    assert_eq!(store.get("x"), Some(&sfdb::encoding::Value::Str("hello".to_string())));
}

/// The echo mode surface: prompts, banner, and per-command timing.
#[test]
fn echo_mode_and_timing() {
    let (_dir, addr) = spawn(|_| {});
    let mut client = Client::connect(addr);

    client.read_until("Access token: ");
    client.send("");
    client.read_until("authorized as guest");
    client.read_until("guest> ");

    client.send("@timing on");
    client.read_until("guest> ");

    client.send("set k v");
    let out = client.read_until("guest> ");
    assert!(out.contains("1 entry inserted"), "missing set response: {out:?}");
    assert!(out.contains("ms to execute."), "missing timing suffix: {out:?}");

    client.send("get k");
    let out = client.read_until("guest> ");
    assert!(out.contains('v'), "missing value echo: {out:?}");
}

/// An unauthenticated session is closed once the auth timer elapses.
#[test]
fn auth_timeout() {
    let (_dir, addr) = spawn(|_| {});
    let mut client = Client::connect(addr);
    client.read_until("Access token: ");
    // Send nothing; the server must time the session out and close it.
    let out = client.read_to_end();
    assert!(out.contains("authentication timed out"), "got {out:?}");
}
