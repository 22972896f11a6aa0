// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use uring_writer::{Connection, Result, UringWriter};

fn main() -> Result<()> {
    pretty_env_logger::init();

    // Writes enter the kernel one by one, without waiting for them.
    let mut writer = UringWriter::builder().ring_depth(64).init()?;
    let stdout = Connection::from_fd(1);

    for round in 0..3 {
        writer.start_of_loop()?;
        writer.submit_write(stdout, format!("Hello {} ...\n", round).as_bytes())?;
        writer.submit_write(stdout, format!("... {} World!\n", round).as_bytes())?;
        writer.write_done(stdout)?;
        writer.end_of_loop()?;
    }

    // Whatever is still in flight is reaped on the next iteration, so run
    // empty ones until nothing is left.
    while writer.in_flight() > 0 {
        writer.start_of_loop()?;
        writer.end_of_loop()?;
    }

    for fault in writer.take_faults() {
        eprintln!("{}", fault);
    }
    Ok(())
}
