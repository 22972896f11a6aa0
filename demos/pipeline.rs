// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{os::unix::io::RawFd, thread};

use uring_writer::{Connection, UringWriter, WriterError};

const ITERATIONS: usize = 100;
const CONNECTIONS: usize = 4;

// Each "connection" is the write end of a pipe, drained by its own thread
// which checks that responses arrive in the order they were issued.
fn reader(fd: RawFd, id: usize) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut stream = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => stream.extend_from_slice(&buf[..n]),
            }
        }
        let text = String::from_utf8_lossy(&stream);
        for (expected, line) in text.lines().enumerate() {
            assert_eq!(line, format!("conn {} response {}", id, expected));
        }
        text.lines().count()
    })
}

fn main() -> Result<(), WriterError> {
    pretty_env_logger::init();

    // Everything is handed over in one enter per iteration, and each
    // iteration drains before the next starts.
    let mut writer = UringWriter::builder()
        .ring_depth(256)
        .batching(true)
        .pipelining(true)
        .init()?;

    let mut readers = Vec::new();
    let mut connections = Vec::new();
    for id in 0..CONNECTIONS {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        readers.push(reader(rx, id));
        connections.push(Connection::new(tx, id));
    }

    let mut sent = vec![0usize; CONNECTIONS];
    for iteration in 0..ITERATIONS {
        let reaped = writer.start_of_loop()?;
        log::debug!("iteration {}: reaped {} completions", iteration, reaped);
        for conn in &connections {
            let id = conn.private_data();
            for _ in 0..(iteration % 3) + 1 {
                let line = format!("conn {} response {}\n", id, sent[id]);
                writer.submit_write(*conn, line.as_bytes())?;
                sent[id] += 1;
            }
            writer.write_done(*conn)?;
        }
        writer.end_of_loop()?;
    }
    while writer.in_flight() > 0 {
        writer.start_of_loop()?;
        writer.end_of_loop()?;
    }

    for fault in writer.take_faults() {
        eprintln!("{}", fault);
    }
    let stats = writer.stats();
    drop(writer);

    for conn in &connections {
        let _ = nix::unistd::close(conn.fd());
    }
    for (id, handle) in readers.into_iter().enumerate() {
        let lines = handle.join().expect("reader panicked");
        println!("connection {}: {} responses in order", id, lines);
        assert_eq!(lines, sent[id]);
    }
    println!(
        "{} writes, {} enters, {} batches, {} bytes",
        stats.write_calls(),
        stats.enter_calls(),
        stats.batches_flushed(),
        stats.bytes_completed()
    );
    Ok(())
}
