use std::io;
use std::path::Path;

#[allow(dead_code)]
#[path = "../plant.rs"]
mod plant;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use critical_section as _;
use plant::Bench;
use session::{Session, Transcript};

const OUTPUT_DIR: &str = "transcripts";

fn main() -> io::Result<()> {
    record("charge", "Plug in, charge, unplug", &[
        "bms ready on",
        "stage online",
        "pilot duty=50 freq=1000",
        "plug in",
        "advance 1s",
        "status",
        "plug out",
        "step",
        "history",
    ])?;
    record("fault", "Battery kill latches until restart", &[
        "bms ready on",
        "stage online",
        "pilot duty=25 freq=1000",
        "plug in",
        "advance 500ms",
        "bms kill on",
        "advance 200ms",
        "bms kill off",
        "plug out",
        "advance 1s",
        "status",
    ])?;
    record("comms", "Battery goes silent mid-session", &[
        "plug in",
        "advance 300ms",
        "bms silent",
        "advance 3s",
        "status",
        "history",
    ])?;
    Ok(())
}

fn record(name: &str, header: &str, script: &[&str]) -> io::Result<()> {
    let path = Path::new(OUTPUT_DIR).join(format!("{name}.log"));
    let transcript = Transcript::create(&path, header)?;
    let mut bench = Bench::new();
    let (plant, links) = bench.wire();
    let mut session = Session::new(&plant, links, transcript)?;
    for line in script {
        session.handle_command(line)?;
    }
    println!("wrote {}", path.display());
    Ok(())
}
