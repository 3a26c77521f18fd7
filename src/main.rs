//! boot64-emu: emulator for the 64-bit x86 boot path

use std::env;
use std::io::Write as _;

use boot64_emu::config::{self, Config};
use boot64_emu::cpu::Cpu;
use boot64_emu::emu::{load_boot_image, Engine, EngineStatus};
use boot64_emu::io::PortDevice;

/// Debug console on port 0xE9: byte writes go straight to stdout.
struct DebugConsole;

impl PortDevice for DebugConsole {
    fn port_in(&mut self, _port: u16, _size: u8) -> u64 {
        // Reading the debug port identifies it, by convention.
        0xE9
    }

    fn port_out(&mut self, _port: u16, value: u64, _size: u8) {
        let byte = value as u8;
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut dump_state = false;
    let mut max_steps: Option<u64> = None;
    let mut memory_bytes: Option<u64> = None;
    let mut path = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dump-state" => dump_state = true,
            "--max-steps" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--max-steps needs a value"))?;
                max_steps = Some(
                    config::parse_number(value)
                        .ok_or_else(|| anyhow::anyhow!("bad --max-steps value: {}", value))?,
                );
            }
            "--memory" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--memory needs a value"))?;
                memory_bytes = Some(
                    config::parse_number(value)
                        .ok_or_else(|| anyhow::anyhow!("bad --memory value: {}", value))?,
                );
            }
            other if !other.starts_with('-') => path = Some(other.to_string()),
            other => {
                return Err(anyhow::anyhow!("unknown option: {}", other));
            }
        }
    }

    let Some(path) = path else {
        eprintln!("usage: boot64-emu [--dump-state] [--max-steps N] [--memory BYTES] <image.bin>");
        std::process::exit(2);
    };

    let config = Config::get();
    let memory_bytes = memory_bytes.unwrap_or_else(|| config.memory_bytes());
    let max_steps = max_steps.unwrap_or_else(|| config.max_steps());
    let boot_address = config.boot_address();

    println!("Loading: {}", path);
    let image = std::fs::read(&path)?;

    let mut cpu = Cpu::new(memory_bytes as usize);
    cpu.bus.register(&[0xE9], Box::new(DebugConsole));
    load_boot_image(&mut cpu, &image, boot_address)?;

    let mut engine = Engine::new(cpu);
    engine.max_steps = max_steps;

    loop {
        engine.run(u64::MAX);
        match engine.status {
            EngineStatus::Halted => {
                println!();
                println!("CPU halted after {} steps", engine.total_steps);
                break;
            }
            EngineStatus::Paused => {
                println!();
                println!("Step limit reached after {} steps", engine.total_steps);
                break;
            }
            EngineStatus::Fault => {
                println!();
                if let Some(error) = &engine.last_error {
                    println!("Fatal fault after {} steps: {}", engine.total_steps, error);
                }
                engine.cpu.print_summary();
                std::process::exit(1);
            }
            EngineStatus::Breakpoint { rip } => {
                // No interactive debugger: report and continue.
                println!("breakpoint at 0x{:016X}", rip);
                engine.resume();
            }
            EngineStatus::Idle | EngineStatus::Running => {}
        }
    }

    if dump_state {
        engine.cpu.print_summary();
    }

    Ok(())
}
