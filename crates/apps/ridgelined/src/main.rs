//! The routing daemon: event loop, RIP engine, raw-socket service.

mod config;
mod udp_io;

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;

use ridgeline_event::{EventLoop, IoEventType, TimeVal, PRIORITY_DEFAULT};
use ridgeline_rawsock::{Family, RawSocketManager, SystemTransport};
use rip_core::{AuthHandler, Horizon, PortManager, RipSystem};

use config::Config;
use udp_io::{PortManagerSlot, UdpPortIoFactory};

#[derive(Debug, Parser)]
#[command(
    name = "ridgelined",
    about = "Modular IPv4/IPv6 routing daemon (RIPv2 engine, OLSR codec, raw-socket service)"
)]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "ridgelined.toml")]
    config: PathBuf,

    /// Service-discovery endpoint, host[:port]. Accepted for suite
    /// compatibility; discovery wiring lives outside this daemon.
    #[arg(short = 'F', long = "finder")]
    finder: Option<String>,

    /// Raise log verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    if let Some(finder) = &args.finder {
        log::info!("service-discovery endpoint {finder} noted; no finder client in this build");
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("fatal: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(config: Config) -> Result<(), String> {
    let eventloop = EventLoop::new();
    let iftree = Rc::new(RefCell::new(config.build_iftree()));

    // --- RIP ---------------------------------------------------------
    let rip = RipSystem::new(eventloop.timer_list().clone());
    let pm_slot: PortManagerSlot = Rc::new(RefCell::new(None));
    let factory = UdpPortIoFactory::new(eventloop.selector_list().clone(), Rc::clone(&pm_slot));
    let port_manager = PortManager::new(
        rip.timers(),
        rip.route_db(),
        Rc::clone(&iftree),
        Box::new(factory),
    );
    *pm_slot.borrow_mut() = Some(port_manager.clone());

    if config.rip.enabled {
        let horizon: Horizon = config
            .rip
            .horizon
            .parse()
            .map_err(|e: String| format!("rip.horizon: {e}"))?;

        for iface in &config.interfaces {
            let port = port_manager
                .add_rip_address(&iface.name, iface.vifname(), iface.address)
                .map_err(|e| e.to_string())?;
            let mut p = port.borrow_mut();
            p.set_cost(config.rip.cost);
            p.set_horizon(horizon);
            p.set_advertise(config.rip.advertise);
            p.set_accept_default_route(config.rip.accept_default_route);
            p.set_advertise_default_route(config.rip.advertise_default_route);

            {
                let constants = p.constants();
                let mut c = constants.borrow_mut();
                if let Some(secs) = config.rip.expiry_secs {
                    c.set_expiry_secs(secs);
                }
                if let Some(secs) = config.rip.deletion_secs {
                    c.set_deletion_secs(secs);
                }
                if let Some(secs) = config.rip.unsolicited_response_secs {
                    c.set_unsolicited_response_secs(secs);
                }
            }

            p.set_auth(build_auth(&config, &rip)?);
        }
        log::info!(
            "RIP running on {} address(es), horizon {horizon}, authentication {}",
            config.interfaces.len(),
            config
                .rip
                .auth
                .r#type
                .as_deref()
                .unwrap_or("none")
        );
    }

    // --- Raw-socket service ------------------------------------------
    let rawsock = Rc::new(RefCell::new(RawSocketManager::new(
        Box::new(SystemTransport::new()),
        Rc::clone(&iftree),
    )));
    for receiver in &config.raw_receivers {
        let name = receiver.name.clone();
        let decode_olsr = receiver.decode.as_deref() == Some("olsrv1");
        if receiver.decode.is_some() && !decode_olsr {
            return Err(format!(
                "raw receiver {name}: unknown decoder {:?}",
                receiver.decode
            ));
        }
        let olsr_decoder = olsr_core::MessageDecoder::new();
        rawsock
            .borrow_mut()
            .register_receiver(
                Family::V4,
                &receiver.name,
                &receiver.interface,
                receiver.vifname(),
                receiver.protocol,
                receiver.multicast_loopback,
                move |meta, payload| {
                    log::debug!(
                        "{name}: {} byte(s) proto {} from {} on {}/{}",
                        payload.len(),
                        meta.protocol,
                        meta.src,
                        meta.ifname,
                        meta.vifname
                    );
                    if decode_olsr {
                        // proto-17 payload still carries the UDP header
                        let olsr_payload = payload.get(8..).unwrap_or_default();
                        match olsr_core::Packet::decode(&olsr_decoder, olsr_payload) {
                            Ok(packet) => {
                                for message in &packet.messages {
                                    log::info!(
                                        "{name}: OLSR type {} origin {} ttl {} hops {} seq {}",
                                        message.type_code(),
                                        message.origin,
                                        message.ttl,
                                        message.hops,
                                        message.seqno
                                    );
                                }
                            }
                            Err(err) => log::debug!("{name}: OLSR decode failed: {err}"),
                        }
                    }
                },
            )
            .map_err(|e| e.to_string())?;
        for group in &receiver.groups {
            rawsock
                .borrow_mut()
                .join_multicast_group(
                    Family::V4,
                    &receiver.name,
                    &receiver.interface,
                    receiver.vifname(),
                    receiver.protocol,
                    *group,
                )
                .map_err(|e| e.to_string())?;
        }

        // wire the socket into the readiness loop
        if let Some(fd) = rawsock.borrow().socket_fd(Family::V4, receiver.protocol) {
            let rawsock = Rc::clone(&rawsock);
            let protocol = receiver.protocol;
            eventloop.add_ioevent_cb(
                fd,
                IoEventType::Read,
                move |_, _| rawsock.borrow_mut().handle_readable(Family::V4, protocol),
                PRIORITY_DEFAULT,
            );
        }
    }

    // --- Main loop ---------------------------------------------------
    log::info!("entering event loop");
    while !eventloop.shutdown_requested() {
        eventloop.run();
    }
    log::info!("shutdown requested; draining");

    for iface in &config.interfaces {
        port_manager.remove_rip_address(&iface.name, iface.vifname(), iface.address);
    }
    // give asynchronous teardown a bounded window
    let deadline = eventloop.current_time() + TimeVal::from_secs(2);
    while port_manager.dead_port_count() > 0 && eventloop.current_time() < deadline {
        eventloop.run();
    }
    Ok(())
}

fn build_auth(config: &Config, rip: &RipSystem) -> Result<AuthHandler, String> {
    match config.rip.auth.r#type.as_deref() {
        None | Some("none") => Ok(AuthHandler::none()),
        Some("simple") => {
            let password = config
                .rip
                .auth
                .password
                .as_deref()
                .ok_or("simple authentication needs a password")?;
            Ok(AuthHandler::plaintext(password))
        }
        Some("md5") => {
            let mut handler = AuthHandler::md5(rip.timers());
            if let AuthHandler::Md5(md5) = &mut handler {
                let now = rip.timers().current_time();
                for key in &config.rip.auth.keys {
                    let start = now + TimeVal::from_secs(key.start_secs);
                    let end = match key.end_secs {
                        Some(secs) => now + TimeVal::from_secs(secs),
                        None => TimeVal::MAXIMUM,
                    };
                    md5.add_key(key.id, &key.password, start, end)
                        .map_err(|e| format!("md5 key {}: {e}", key.id))?;
                }
            }
            Ok(handler)
        }
        Some(other) => Err(format!("unknown authentication type {other:?}")),
    }
}
