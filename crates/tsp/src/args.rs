//! Command-line parsing.
//!
//! The invocation form is `tsp [global-opts] [-I name [args]]
//! (-P name [args])* [-O name [args]]`. Plugin arguments are opaque to
//! the front end: everything between one `-I/-P/-O` marker and the next
//! belongs to that plugin and is handed over verbatim.

use anyhow::{anyhow, bail, Result};
use clap::{Arg, ArgAction, Command};
use pipeline::{ChainSpec, ControlOptions, Options, PluginSpec, Realtime};
use std::net::IpAddr;
use std::time::Duration;

/// A fully parsed invocation.
pub struct Invocation {
    pub options: Options,
    pub chain: ChainSpec,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: &'static str,
}

fn global_command() -> Command {
    Command::new("tsp")
        .no_binary_name(true)
        .about("Transport stream processor")
        .arg(
            Arg::new("bitrate")
                .long("bitrate")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Fix the input bitrate in bits/second instead of estimating it"),
        )
        .arg(
            Arg::new("bitrate-adjust-interval")
                .long("bitrate-adjust-interval")
                .value_parser(parse_seconds)
                .help("Seconds between bitrate republications (default 5)"),
        )
        .arg(
            Arg::new("buffer-size-mb")
                .long("buffer-size-mb")
                .value_parser(clap::value_parser!(f64))
                .help("Packet buffer size in MiB, fractions allowed (default 16)"),
        )
        .arg(
            Arg::new("max-input-packets")
                .long("max-input-packets")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-flushed-packets")
                .long("max-flushed-packets")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-output-packets")
                .long("max-output-packets")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("initial-input-packets")
                .long("initial-input-packets")
                .value_parser(clap::value_parser!(usize))
                .help("Packets accumulated before the first downstream wake-up"),
        )
        .arg(
            Arg::new("add-input-stuffing")
                .long("add-input-stuffing")
                .value_name("nullpkt/inpkt")
                .value_parser(parse_ratio)
                .help("Interleave nullpkt null packets every inpkt input packets"),
        )
        .arg(
            Arg::new("add-start-stuffing")
                .long("add-start-stuffing")
                .value_parser(clap::value_parser!(usize))
                .help("Null packets inserted before the first input packet"),
        )
        .arg(
            Arg::new("add-stop-stuffing")
                .long("add-stop-stuffing")
                .value_parser(clap::value_parser!(usize))
                .help("Null packets appended after the last input packet"),
        )
        .arg(
            Arg::new("realtime")
                .long("realtime")
                .num_args(0..=1)
                .default_missing_value("on")
                .value_parser(["on", "off", "auto"])
                .help("Tuning regime (default: auto, from plugin declarations)"),
        )
        .arg(
            Arg::new("ignore-joint-termination")
                .long("ignore-joint-termination")
                .action(ArgAction::SetTrue)
                .help("Keep running even when all joint-termination plugins are done"),
        )
        .arg(
            Arg::new("final-wait")
                .long("final-wait")
                .value_parser(clap::value_parser!(u64))
                .help("Milliseconds to wait for drainage after end of input, 0 = forever"),
        )
        .arg(
            Arg::new("receive-timeout")
                .long("receive-timeout")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Milliseconds allowed for each input receive operation"),
        )
        .arg(
            Arg::new("control-port")
                .long("control-port")
                .value_parser(clap::value_parser!(u16).range(1..))
                .help("Enable the TCP control channel on this port"),
        )
        .arg(
            Arg::new("control-local")
                .long("control-local")
                .value_parser(clap::value_parser!(IpAddr))
                .help("Local address the control channel binds (default 127.0.0.1)"),
        )
        .arg(
            Arg::new("control-source")
                .long("control-source")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(IpAddr))
                .help("Additional peer address allowed on the control channel; repeatable"),
        )
        .arg(
            Arg::new("control-reuse-port")
                .long("control-reuse-port")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("control-timeout")
                .long("control-timeout")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Control session timeout in milliseconds (default 5000)"),
        )
        .arg(
            Arg::new("log-plugin-index")
                .long("log-plugin-index")
                .action(ArgAction::SetTrue)
                .help("Prefix plugin messages with the stage position"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue),
        )
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("invalid duration '{s}'"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("duration '{s}' must be positive"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_ratio(s: &str) -> Result<(u64, u64), String> {
    let (n, i) = s
        .split_once('/')
        .ok_or_else(|| format!("expected nullpkt/inpkt, got '{s}'"))?;
    let n: u64 = n.trim().parse().map_err(|_| format!("invalid count '{n}'"))?;
    let i: u64 = i.trim().parse().map_err(|_| format!("invalid count '{i}'"))?;
    if n == 0 || i == 0 {
        return Err("stuffing ratio terms must be positive".into());
    }
    Ok((n, i))
}

/// Splits argv into global options and plugin sections, then parses the
/// global part.
pub fn parse(args: &[String]) -> Result<Invocation> {
    let mut globals: Vec<String> = Vec::new();
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-I" | "-P" | "-O" => sections.push((arg.clone(), Vec::new())),
            _ => match sections.last_mut() {
                Some((_, section)) => section.push(arg.clone()),
                None => globals.push(arg.clone()),
            },
        }
    }

    let mut chain = ChainSpec::default();
    let mut seen_input = false;
    let mut seen_output = false;
    for (marker, mut section) in sections {
        if section.is_empty() {
            bail!("{marker} requires a plugin name");
        }
        let spec = PluginSpec {
            name: section.remove(0),
            args: section,
        };
        match marker.as_str() {
            "-I" => {
                if seen_input {
                    bail!("at most one -I is allowed");
                }
                seen_input = true;
                chain.input = spec;
            }
            "-P" => chain.processors.push(spec),
            "-O" => {
                if seen_output {
                    bail!("at most one -O is allowed");
                }
                seen_output = true;
                chain.output = spec;
            }
            _ => unreachable!(),
        }
    }

    // Let clap render --help and usage errors itself; everything else
    // surfaces as a parse failure.
    let matches = match global_command().try_get_matches_from(&globals) {
        Ok(m) => m,
        Err(e) if e.use_stderr() => return Err(anyhow!("{e}")),
        Err(e) => e.exit(),
    };

    let defaults = Options::default();
    let mut options = Options {
        fixed_bitrate: matches.get_one::<u64>("bitrate").copied(),
        buffer_size_mb: matches
            .get_one::<f64>("buffer-size-mb")
            .copied()
            .unwrap_or(defaults.buffer_size_mb),
        max_input_packets: matches.get_one::<usize>("max-input-packets").copied(),
        max_flushed_packets: matches.get_one::<usize>("max-flushed-packets").copied(),
        max_output_packets: matches.get_one::<usize>("max-output-packets").copied(),
        initial_input_packets: matches.get_one::<usize>("initial-input-packets").copied(),
        add_input_stuffing: matches.get_one::<(u64, u64)>("add-input-stuffing").copied(),
        add_start_stuffing: matches
            .get_one::<usize>("add-start-stuffing")
            .copied()
            .unwrap_or(0),
        add_stop_stuffing: matches
            .get_one::<usize>("add-stop-stuffing")
            .copied()
            .unwrap_or(0),
        ignore_joint_termination: matches.get_flag("ignore-joint-termination"),
        final_wait: matches
            .get_one::<u64>("final-wait")
            .copied()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis),
        receive_timeout: matches
            .get_one::<u64>("receive-timeout")
            .copied()
            .map(Duration::from_millis),
        log_plugin_index: matches.get_flag("log-plugin-index"),
        ..defaults
    };
    if let Some(interval) = matches.get_one::<Duration>("bitrate-adjust-interval") {
        options.bitrate_adjust_interval = *interval;
    }
    options.realtime = match matches.get_one::<String>("realtime").map(String::as_str) {
        Some("on") => Realtime::On,
        Some("off") => Realtime::Off,
        _ => Realtime::Auto,
    };
    if let Some(port) = matches.get_one::<u16>("control-port").copied() {
        let mut control = ControlOptions::new(port);
        if let Some(local) = matches.get_one::<IpAddr>("control-local") {
            control.local = *local;
        }
        control.sources = matches
            .get_many::<IpAddr>("control-source")
            .into_iter()
            .flatten()
            .copied()
            .collect();
        control.reuse_port = matches.get_flag("control-reuse-port");
        if let Some(ms) = matches.get_one::<u64>("control-timeout").copied() {
            control.session_timeout = Duration::from_millis(ms);
        }
        options.control = Some(control);
    } else if matches.contains_id("control-local")
        || matches.get_flag("control-reuse-port")
        || matches.contains_id("control-timeout")
    {
        bail!("control channel options require --control-port");
    }

    let log_level = if matches.get_flag("debug") {
        "tsp=trace,pipeline=trace"
    } else if matches.get_flag("verbose") {
        "tsp=debug,pipeline=debug"
    } else {
        "tsp=info,pipeline=info"
    };

    Ok(Invocation {
        options,
        chain,
        log_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_invocation_uses_stdio_chain() {
        let inv = parse(&[]).unwrap();
        assert_eq!(inv.chain.input.name, "file");
        assert_eq!(inv.chain.input.args, vec!["-"]);
        assert_eq!(inv.chain.output.name, "file");
        assert!(inv.chain.processors.is_empty());
    }

    #[test]
    fn chain_splitting_keeps_plugin_args_verbatim() {
        let inv = parse(&argv(&[
            "--buffer-size-mb", "4",
            "-I", "file", "in.ts",
            "-P", "filter", "--pid", "0x100", "--drop",
            "-P", "drop-nulls",
            "-O", "file", "out.ts",
        ]))
        .unwrap();
        assert_eq!(inv.options.buffer_size_mb, 4.0);
        assert_eq!(inv.chain.input.args, vec!["in.ts"]);
        assert_eq!(inv.chain.processors.len(), 2);
        assert_eq!(
            inv.chain.processors[0].args,
            vec!["--pid", "0x100", "--drop"]
        );
        assert_eq!(inv.chain.output.args, vec!["out.ts"]);
    }

    #[test]
    fn duplicate_input_is_rejected() {
        assert!(parse(&argv(&["-I", "file", "-I", "file"])).is_err());
    }

    #[test]
    fn marker_without_name_is_rejected() {
        assert!(parse(&argv(&["-P"])).is_err());
    }

    #[test]
    fn stuffing_ratio_parsing() {
        assert_eq!(parse_ratio("1/9"), Ok((1, 9)));
        assert!(parse_ratio("1-9").is_err());
        assert!(parse_ratio("0/9").is_err());
        let inv = parse(&argv(&["--add-input-stuffing", "2/7"])).unwrap();
        assert_eq!(inv.options.add_input_stuffing, Some((2, 7)));
    }

    #[test]
    fn realtime_tristate() {
        assert_eq!(parse(&[]).unwrap().options.realtime, Realtime::Auto);
        assert_eq!(
            parse(&argv(&["--realtime"])).unwrap().options.realtime,
            Realtime::On
        );
        assert_eq!(
            parse(&argv(&["--realtime", "off"])).unwrap().options.realtime,
            Realtime::Off
        );
    }

    #[test]
    fn final_wait_zero_means_forever() {
        let inv = parse(&argv(&["--final-wait", "0"])).unwrap();
        assert_eq!(inv.options.final_wait, None);
        let inv = parse(&argv(&["--final-wait", "2500"])).unwrap();
        assert_eq!(inv.options.final_wait, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn control_options_require_a_port() {
        assert!(parse(&argv(&["--control-reuse-port"])).is_err());
        let inv = parse(&argv(&[
            "--control-port", "4004",
            "--control-source", "192.168.1.9",
            "--control-timeout", "1000",
        ]))
        .unwrap();
        let control = inv.options.control.unwrap();
        assert_eq!(control.port, 4004);
        assert_eq!(control.sources.len(), 1);
        assert_eq!(control.session_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn globals_after_first_marker_belong_to_plugins() {
        let inv = parse(&argv(&["-I", "file", "--buffer-size-mb", "4"])).unwrap();
        assert_eq!(inv.chain.input.args, vec!["--buffer-size-mb", "4"]);
        assert_eq!(inv.options.buffer_size_mb, 16.0);
    }
}
