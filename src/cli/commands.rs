use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, LogFormat};
use crate::devices::descriptor::IdentityTable;
use crate::devices::{PortEnumerator, SystemPortEnumerator};
use crate::output::analyzer::{self, ExportFormat};
use crate::output::{ConsoleDisplay, RecordLogger, SinkHandle};
use crate::services::{DeviceManager, HistoryMonitor};
use crate::utils::error::TelemetryError;

// How long one-shot commands wait for channels to open
const OPEN_WAIT: Duration = Duration::from_secs(5);

pub fn build_cli() -> Command {
    Command::new("esp-telemetry")
        .version(crate::VERSION)
        .about("Collect telemetry from USB-serial devices")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("Serial port to use instead of discovery (repeatable)"),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("RATE")
                .help("Baud rate"),
        )
        .subcommand(Command::new("list-devices").about("List serial ports and mark known devices"))
        .subcommand(
            Command::new("monitor")
                .about("Stream telemetry from every device")
                .arg(Arg::new("log").short('l').long("log").action(ArgAction::SetTrue).help("Write records to log files"))
                .arg(Arg::new("format").short('f').long("format").value_name("jsonl|csv|log").help("Log file format"))
                .arg(Arg::new("output-dir").short('o').long("output-dir").value_name("DIR").help("Log directory"))
                .arg(
                    Arg::new("separate-logs")
                        .long("separate-logs")
                        .action(ArgAction::SetTrue)
                        .help("One log file per device"),
                )
                .arg(Arg::new("duration").short('d').long("duration").value_name("SECONDS").help("Stop after this many seconds"))
                .arg(
                    Arg::new("perf-report")
                        .long("perf-report")
                        .action(ArgAction::SetTrue)
                        .help("Request a performance report on start"),
                )
                .arg(
                    Arg::new("speed-test")
                        .long("speed-test")
                        .action(ArgAction::SetTrue)
                        .help("Start a speed test on start"),
                )
                .arg(Arg::new("interval").short('i').long("interval").value_name("MS").help("Set the report interval")),
        )
        .subcommand(
            Command::new("send")
                .about("Send a command to every device")
                .arg(Arg::new("command").required(true).value_name("COMMAND")),
        )
        .subcommand(
            Command::new("analyze")
                .about("Summarize a record file")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(Arg::new("device").long("device").value_name("ID").help("Only this device"))
                .arg(Arg::new("field").long("field").value_name("NAME").help("Only this field"))
                .arg(Arg::new("export").long("export").value_name("PATH").help("Write the summary to a file"))
                .arg(
                    Arg::new("export-format")
                        .long("export-format")
                        .value_name("json|text")
                        .default_value("json"),
                ),
        )
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, TelemetryError> {
    matches
        .get_one::<String>(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| TelemetryError::ConfigError(format!("Invalid --{}: {}", name, raw)))
        })
        .transpose()
}

fn parse_duration(matches: &ArgMatches) -> Result<Option<Duration>, TelemetryError> {
    parse_arg::<f64>(matches, "duration")?
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|_| {
                TelemetryError::ConfigError(format!("Invalid --duration: {}", secs))
            })
        })
        .transpose()
}

/// Run the selected subcommand. Returns false when none was given.
pub async fn handle_subcommands(matches: &ArgMatches, config: Config) -> Result<bool, TelemetryError> {
    match matches.subcommand() {
        Some(("list-devices", _)) => {
            list_devices(&config)?;
            Ok(true)
        }
        Some(("monitor", sub)) => {
            let mut config = config;
            apply_monitor_args(&mut config, sub)?;
            monitor(Arc::new(config), sub).await?;
            Ok(true)
        }
        Some(("send", sub)) => {
            let command = sub
                .get_one::<String>("command")
                .ok_or_else(|| TelemetryError::ConfigError("Missing command".to_string()))?;
            send(Arc::new(config), command).await?;
            Ok(true)
        }
        Some(("analyze", sub)) => {
            analyze(sub)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn list_devices(config: &Config) -> Result<(), TelemetryError> {
    let table = IdentityTable::from_config(config);
    let ports = SystemPortEnumerator.enumerate()?;

    println!("📡 Serial ports ({}):", ports.len());
    for port in &ports {
        let known = match (port.vendor_id, port.product_id) {
            (Some(vid), Some(pid)) => {
                let label = table.label_for(vid, pid).map(|l| format!(" ✅ {}", l)).unwrap_or_default();
                format!("{:04X}:{:04X}{}", vid, pid, label)
            }
            _ => "not USB".to_string(),
        };
        println!("   {} [{}]", port.port_path, known);
        if let Some(manufacturer) = &port.manufacturer {
            println!("      📱 Manufacturer: {}", manufacturer);
        }
    }
    for port in &config.ports {
        println!("   {} [configured]", port.port_path);
    }
    Ok(())
}

fn apply_monitor_args(config: &mut Config, matches: &ArgMatches) -> Result<(), TelemetryError> {
    if matches.get_flag("log") {
        config.logging.enabled = true;
    }
    if let Some(format) = parse_arg::<LogFormat>(matches, "format")? {
        config.logging.format = format;
    }
    if let Some(dir) = matches.get_one::<String>("output-dir") {
        config.logging.output_dir = PathBuf::from(dir);
    }
    if matches.get_flag("separate-logs") {
        config.logging.separate_devices = true;
    }
    Ok(())
}

async fn wait_for_open(manager: &DeviceManager, limit: Duration) -> usize {
    let deadline = Instant::now() + limit;
    let total = manager.device_ids().len();
    loop {
        let open = manager.open_count();
        if open == total || Instant::now() >= deadline {
            return open;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn report_broadcast(command: &str, results: &crate::services::BroadcastResults) {
    for (device_id, result) in results {
        match result {
            Ok(()) => println!("✅ {} <- {}", device_id, command),
            Err(e) => println!("❌ {}: {}", device_id, e),
        }
    }
}

async fn monitor(config: Arc<Config>, matches: &ArgMatches) -> Result<(), TelemetryError> {
    let duration = parse_duration(matches)?;
    let interval = parse_arg::<u64>(matches, "interval")?;

    let manager = DeviceManager::new(Arc::clone(&config));
    let history = Arc::new(HistoryMonitor::new(config.history_size));
    manager.register_callback(Arc::new(ConsoleDisplay::stdout()), None);
    manager.register_callback(history.clone(), None);

    let sink = if config.logging.enabled {
        let sink = SinkHandle::spawn(RecordLogger::new(&config.logging)?);
        manager.register_callback(sink.handler(), None);
        Some(sink)
    } else {
        None
    };

    manager.discover_and_connect();
    manager.start_all()?;

    let open = wait_for_open(&manager, OPEN_WAIT).await;
    info!("📡 {} of {} devices open", open, manager.device_ids().len());

    if let Some(millis) = interval {
        report_broadcast("SET_INTERVAL", &manager.set_interval(millis));
    }
    if matches.get_flag("perf-report") {
        report_broadcast("PERF_REPORT", &manager.request_perf_report());
    }
    if matches.get_flag("speed-test") {
        report_broadcast("SPEED_TEST", &manager.start_speed_test());
    }

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => info!("⏱️ Monitoring time elapsed"),
                _ = tokio::signal::ctrl_c() => info!("🛑 Interrupted"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("⚠️ Cannot listen for Ctrl-C: {}", e);
            }
            info!("🛑 Interrupted");
        }
    }

    let report = manager.stop_all().await;
    if !report.forced.is_empty() {
        warn!("⚠️ Forced close: {}", report.forced.join(", "));
    }

    if let Some(sink) = sink {
        let sink_report = sink.close().await?;
        println!("💾 {} records written", sink_report.entries);
        for file in &sink_report.files {
            println!("   {}", file.display());
        }
    }

    println!("📊 Session summary:");
    for snapshot in manager.snapshots() {
        let rssi = history.statistics(&snapshot.device_id, "rssi");
        let avg = rssi.avg.map(|v| format!("{:.1} dBm", v)).unwrap_or_else(|| "-".to_string());
        println!(
            "   {} [{}] lines {} | samples {} | parse failures {} | reconnects {} | avg RSSI {}",
            snapshot.device_id,
            snapshot.state,
            snapshot.stats.lines_received,
            snapshot.stats.samples_parsed,
            snapshot.stats.parse_failures(),
            snapshot.stats.reconnects,
            avg
        );
    }
    Ok(())
}

async fn send(config: Arc<Config>, command: &str) -> Result<(), TelemetryError> {
    let command: crate::devices::DeviceCommand = command.parse()?;
    let manager = DeviceManager::new(config);
    manager.discover_and_connect();
    manager.start_all()?;

    if wait_for_open(&manager, OPEN_WAIT).await == 0 {
        warn!("⚠️ No device opened within {}s", OPEN_WAIT.as_secs());
    }
    let wire = command.to_wire();
    report_broadcast(&wire, &manager.broadcast(&wire));

    manager.stop_all().await;
    Ok(())
}

fn analyze(matches: &ArgMatches) -> Result<(), TelemetryError> {
    let file = matches
        .get_one::<String>("file")
        .ok_or_else(|| TelemetryError::ConfigError("Missing file".to_string()))?;
    let device = matches.get_one::<String>("device").map(String::as_str);

    let mut samples = analyzer::load(file)?;
    if let Some(device) = device {
        samples.retain(|s| s.device_id == device);
    }

    if let Some(field) = matches.get_one::<String>("field") {
        let stats = analyzer::statistics(&samples, field, None);
        let unit = analyzer::unit_for(field).unwrap_or("");
        println!("📈 {} over {} samples", field, stats.count);
        if let (Some(min), Some(avg), Some(max)) = (stats.min, stats.avg, stats.max) {
            println!("   min {:.2}{} | avg {:.2}{} | max {:.2}{}", min, unit, avg, unit, max, unit);
        }
        if let Some(spread) = stats.spread {
            println!("   spread {:.2}{}", spread, unit);
        }
        return Ok(());
    }

    let summary = analyzer::summarize(&samples);
    print!("{}", analyzer::render_text(&summary));

    if let Some(path) = matches.get_one::<String>("export") {
        let format = parse_arg::<ExportFormat>(matches, "export-format")?.unwrap_or(ExportFormat::Json);
        analyzer::export_summary(&summary, path, format)?;
        println!("💾 Summary written to {}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_port_and_monitor_flags() {
        let matches = build_cli()
            .try_get_matches_from([
                "esp-telemetry", "-p", "/dev/ttyUSB0", "--port", "/dev/ttyUSB1", "--baud", "921600",
                "monitor", "--log", "--format", "csv", "--separate-logs",
            ])
            .unwrap();

        let mut config = Config::default();
        config.apply_matches(&matches).unwrap();
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.ports.len(), 2);

        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "monitor");
        apply_monitor_args(&mut config, sub).unwrap();
        assert!(config.logging.enabled);
        assert!(config.logging.separate_devices);
        assert_eq!(config.logging.format, LogFormat::Csv);
    }

    #[test]
    fn test_bad_numeric_argument() {
        let matches = build_cli()
            .try_get_matches_from(["esp-telemetry", "monitor", "--duration", "soon"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert!(parse_arg::<f64>(sub, "duration").is_err());
    }

    #[test]
    fn test_duration_must_be_finite_and_positive() {
        for bad in ["--duration=-1", "--duration=nan", "--duration=inf"] {
            let matches = build_cli()
                .try_get_matches_from(["esp-telemetry", "monitor", bad])
                .unwrap();
            let (_, sub) = matches.subcommand().unwrap();
            assert!(
                matches!(parse_duration(sub), Err(TelemetryError::ConfigError(_))),
                "{}",
                bad
            );
        }

        let matches = build_cli()
            .try_get_matches_from(["esp-telemetry", "monitor", "--duration", "1.5"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(parse_duration(sub).unwrap(), Some(Duration::from_millis(1500)));
    }
}
