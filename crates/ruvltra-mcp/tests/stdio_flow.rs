use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use serde_json::{json, Value};

fn spawn_server() -> std::process::Child {
    Command::new(env!("CARGO_BIN_EXE_ruvltrad"))
        .env("RUVLTRA_MIN_WORKERS", "1")
        .env("RUVLTRA_MAX_WORKERS", "1")
        .env("RUVLTRA_INITIAL_WORKERS", "1")
        .env("RUVLTRA_MOCK_LATENCY_MS", "5")
        .env("RUVLTRA_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ruvltrad")
}

#[test]
fn line_delimited_generate_flow_works() {
    let mut child = spawn_server();
    let mut child_stdin = child.stdin.take().expect("stdin");
    let child_stdout = child.stdout.take().expect("stdout");
    let mut reader = BufReader::new(child_stdout);

    let requests = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "stdio-test", "version": "1.0.0"}
        }}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {
            "name": "ruvltra_code_generate",
            "arguments": {"instruction": "hello"}
        }}),
    ];
    for request in &requests {
        writeln!(child_stdin, "{request}").expect("write request");
    }
    drop(child_stdin);

    let mut line = String::new();
    reader.read_line(&mut line).expect("read init response");
    let init: Value = serde_json::from_str(&line).expect("parse init response");
    assert_eq!(init["result"]["serverInfo"]["name"], json!("ruvltra"));
    assert_eq!(
        init["result"]["protocolVersion"],
        json!("2024-11-05")
    );

    line.clear();
    reader.read_line(&mut line).expect("read generate response");
    let generate: Value = serde_json::from_str(&line).expect("parse generate response");
    let body = &generate["result"]["structuredContent"];
    assert_eq!(body["backend"], json!("mock"));
    assert_eq!(body["workerId"], json!("worker-1"));
    assert!(!body["output"].as_str().expect("output").is_empty());

    let status = child.wait().expect("wait child");
    assert!(status.success());
}

fn write_framed(stdin: &mut std::process::ChildStdin, payload: &Value) {
    let body = serde_json::to_vec(payload).expect("serialize payload");
    let frame = format!("Content-Length: {}\r\n\r\n", body.len());
    stdin
        .write_all(frame.as_bytes())
        .expect("write frame header");
    stdin.write_all(&body).expect("write frame body");
    stdin.flush().expect("flush frame");
}

fn read_framed(reader: &mut BufReader<std::process::ChildStdout>) -> Value {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read frame header");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }

    let len = content_length.expect("content-length header");
    let mut body = vec![0_u8; len];
    std::io::Read::read_exact(reader, &mut body).expect("read frame body");
    serde_json::from_slice(&body).expect("parse framed response")
}

#[test]
fn content_length_framed_tools_list_works() {
    let mut child = spawn_server();
    let mut child_stdin = child.stdin.take().expect("stdin");
    let child_stdout = child.stdout.take().expect("stdout");
    let mut reader = BufReader::new(child_stdout);

    write_framed(
        &mut child_stdin,
        &json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}),
    );
    let tools = read_framed(&mut reader);
    let names: Vec<&str> = tools["result"]["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"ruvltra_code_generate"));
    assert!(names.contains(&"ruvltra_swarm_review"));
    assert!(names.contains(&"ruvltra_status"));

    drop(child_stdin);
    let status = child.wait().expect("wait child");
    assert!(status.success());
}
