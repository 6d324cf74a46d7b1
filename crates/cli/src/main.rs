//! avrsim — config-driven frontend for the AVR simulation core.
//!
//! Reads a key/value configuration file, builds the simulated MCU, loads
//! the firmware image, and drives the cycle loop. Optional collaborators
//! wired here: a VCD trace writer (`vcd_file` + `dump_regs`) and a GDB
//! remote-debug endpoint (`rsp_port`).
//!
//! Exit codes: 0 on a clean stop, 1 on configuration or load errors, 2
//! when the firmware run ends in a test failure.

mod config;

use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use avrsim_core::device::{DeviceProfile, DumpReg};
use avrsim_core::model::{self, Model};
use avrsim_core::rsp::{RspServer, RspSession};
use avrsim_core::vcd::VcdDump;
use avrsim_core::{Mcu, RunState};

use config::Config;

/// Cycle-accurate AVR microcontroller simulator
#[derive(Parser, Debug)]
#[command(name = "avrsim", version, about = "Cycle-accurate AVR microcontroller simulator")]
struct Args {
    /// Path to the simulator configuration file
    config: PathBuf,

    /// Firmware image, overriding `firmware_file` from the configuration
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Remote-debug port, overriding `rsp_port` from the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    match run(args) {
        Ok(state) if state == RunState::TestFail => {
            error!("simulation ended in test failure");
            ExitCode::from(2)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<RunState> {
    let text = fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let cfg = Config::parse(&text).context("parsing configuration")?;

    let profile = DeviceProfile::by_name(&cfg.mcu)?;
    info!("device: {} ({} KB flash)", profile.name, profile.pm_size() / 1024);
    let mut mcu = Mcu::new(profile)?;

    for (n, fuse) in [cfg.lfuse, cfg.hfuse, cfg.efuse].into_iter().enumerate() {
        if let Some(v) = fuse {
            mcu.set_fuse(n as u32, v)
                .with_context(|| format!("applying fuse byte #{}", n))?;
        }
    }
    if let Some(lock) = cfg.lockbits {
        mcu.set_lockbits(lock);
    }
    if let Some(freq) = cfg.mcu_freq {
        mcu.freq = freq;
    }
    mcu.intr.trap_at_isr = cfg.trap_at_isr;
    info!("clock: {} Hz ({:?})", mcu.freq, mcu.clk_source);

    let firmware_path = args
        .firmware
        .or(cfg.firmware_file)
        .context("no firmware image: give 'firmware_file' or --firmware")?;
    let image = fs::read_to_string(&firmware_path)
        .with_context(|| format!("reading {}", firmware_path.display()))?;
    let loaded = mcu.load_firmware(&image, cfg.reset_flash)?;
    info!("firmware: {} ({} bytes)", firmware_path.display(), loaded);

    // Trace selection; unknown names are reported, not fatal.
    let mut selection: Vec<DumpReg> = Vec::new();
    for name in &cfg.dump_regs {
        match mcu.device.resolve_dump_reg(name) {
            Some(sel) => selection.push(sel),
            None => warn!("dump_regs: no register named '{}' on {}", name, mcu.device.name),
        }
    }
    let mut vcd = match (&cfg.vcd_file, selection.is_empty()) {
        (Some(path), false) => {
            let file = BufWriter::new(
                File::create(path).with_context(|| format!("creating {}", path.display()))?,
            );
            info!("vcd: dumping {} registers to {}", selection.len(), path.display());
            Some(VcdDump::create(file, &mcu, &selection)?)
        }
        _ => None,
    };

    // Script-backed peripheral models need an embedding frontend; the
    // core-side hook is the `Model` trait.
    let mut models: Vec<Box<dyn Model>> = Vec::new();
    for path in &cfg.lua_models {
        warn!(
            "lua_model {}: script models are not supported by this frontend",
            path.display()
        );
    }
    for m in models.iter_mut() {
        m.config(&mut mcu);
    }

    let rsp_port = args.port.or(cfg.rsp_port);
    let final_state = match rsp_port {
        Some(port) => run_with_debugger(&mut mcu, port, &mut vcd, &mut models)?,
        None => run_free(&mut mcu, &mut vcd, &mut models),
    };

    if let Some(v) = vcd.take() {
        v.finish().context("closing the VCD dump")?;
    }
    info!("stopped after {} cycles in state {:?}", mcu.cycles, final_state);

    if cfg.firmware_test && final_state != RunState::TestFail {
        info!("firmware test passed");
    }
    Ok(final_state)
}

type Vcd = VcdDump<BufWriter<File>>;

fn hook_pass(mcu: &mut Mcu, vcd: &mut Option<Vcd>, models: &mut [Box<dyn Model>]) {
    if let Some(v) = vcd.as_mut() {
        if let Err(e) = v.dump_frame(mcu, mcu.cycles) {
            warn!("vcd: write failed: {}", e);
        }
    }
    model::tick_models(mcu, models);
}

/// Free-running driver loop: exit on Stop/TestFail, treat a BREAK halt as
/// the end of the run.
fn run_free(mcu: &mut Mcu, vcd: &mut Option<Vcd>, models: &mut Vec<Box<dyn Model>>) -> RunState {
    loop {
        if mcu.run_state.is_exit() || mcu.run_state == RunState::Stopped {
            return mcu.run_state;
        }
        if let Err(e) = mcu.run_cycle() {
            error!("{}", e);
            mcu.set_run_state(RunState::TestFail);
            return RunState::TestFail;
        }
        hook_pass(mcu, vcd, models);
    }
}

/// Debugger-attached loop: start halted, process one remote command per
/// idle pass, report stops back to the client.
fn run_with_debugger(
    mcu: &mut Mcu,
    port: u16,
    vcd: &mut Option<Vcd>,
    models: &mut Vec<Box<dyn Model>>,
) -> Result<RunState> {
    let server = RspServer::bind(port).with_context(|| format!("binding port {}", port))?;
    info!("rsp: waiting for a debugger on port {}", server.port());
    let mut session: RspSession = server.accept()?;
    mcu.set_run_state(RunState::Stopped);

    loop {
        if mcu.run_state.is_exit() {
            return Ok(mcu.run_state);
        }
        match mcu.run_state {
            RunState::Stopped => {
                let action = session.process_packet(mcu)?;
                if !session.apply_action(mcu, action) {
                    info!("rsp: client detached");
                    return Ok(RunState::Stop);
                }
            }
            RunState::Step => {
                if let Err(e) = mcu.finish_instruction() {
                    error!("{}", e);
                    mcu.set_run_state(RunState::TestFail);
                    continue;
                }
                hook_pass(mcu, vcd, models);
                if mcu.run_state == RunState::Step {
                    mcu.set_run_state(RunState::Stopped);
                }
                session.send_stop_reply()?;
            }
            _ => {
                if let Err(e) = mcu.run_cycle() {
                    error!("{}", e);
                    mcu.set_run_state(RunState::TestFail);
                    continue;
                }
                hook_pass(mcu, vcd, models);
                if mcu.run_state == RunState::Stopped {
                    // Breakpoint hit while free-running.
                    session.send_stop_reply()?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_run_to_break() {
        let mut mcu = Mcu::new(DeviceProfile::atmega328p()).unwrap();
        // LDI R16, 0x2A; BREAK
        mcu.mem.pm[0] = 0x0A;
        mcu.mem.pm[1] = 0xE2;
        mcu.mem.pm[2] = 0x98;
        mcu.mem.pm[3] = 0x95;
        let state = run_free(&mut mcu, &mut None, &mut Vec::new());
        assert_eq!(state, RunState::Stopped);
        assert_eq!(mcu.mem.reg(16), 0x2A);
    }

    #[test]
    fn test_bail_is_config_error() {
        // Parse errors surface as anyhow errors, mapped to exit code 1.
        assert!(Config::parse("nonsense").is_err());
    }
}
