use crate::mqtt;
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use evcharger_lib::session;
use std::time::Duration;

fn parse_time(value: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
}

fn parse_days(value: &str) -> Result<u8, String> {
    if value.is_empty() || value.len() > 7 {
        return Err(format!("'{value}' is not a mask of up to 7 days"));
    }
    u8::from_str_radix(value, 2).map_err(|err| format!("'{value}' is not a binary mask: {err}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the charger model: phase count and name
    Model,
    /// Show the fault flags
    Faults,
    /// Show currents, voltages, power, temperature and charge state (fetches the model first)
    Realtime,
    /// Show the control settings: RFID, app control, DLB, limits, reservation
    Controls,
    /// Show the consumption of the recent days, months and years
    Records,
    /// Show the daily consumption of one month
    MonthRecords {
        /// Year, e.g. 2024
        year: i32,
        /// Month 1 to 12
        month: u32,
    },
    /// Show all available charger information by running the read commands
    All,
    /// Find the IP address of a charger by its device code (use a broadcast host)
    Discover {
        /// Device code printed on the charger
        device_code: String,
    },
    /// Send a heartbeat
    Heartbeat,
    /// Start or stop charging
    SetCharge {
        /// Start charging. If this flag is not present, charging is stopped.
        #[clap(long, short, action)]
        start: bool,
    },
    /// Configure timed charging
    SetTimedCharge {
        /// Enable timed charging. If this flag is not present, it will be disabled.
        #[clap(long, short, action)]
        enable: bool,
        /// Start time, e.g. "22:00" or "22:00:00"
        #[clap(value_parser = parse_time)]
        start: NaiveTime,
        /// End time
        #[clap(value_parser = parse_time)]
        end: NaiveTime,
    },
    /// Enable or disable RFID cards and the app control
    SetRfidAndApp {
        #[clap(long, action)]
        rfid: bool,
        #[clap(long, action)]
        app: bool,
    },
    /// Enable or disable dynamic load balancing
    SetDlb {
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Enable or disable the grounding detection
    SetGroundingDetection {
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Set the maximum charge current in ampere
    SetMaxCurrent { amps: u8 },
    /// Set the maximum charge power in kW
    SetMaxPower { power: u8 },
    /// Set the maximum energy per month in kWh
    SetMaxMonthlyPower { power: u16 },
    /// Configure the charge reservation
    SetReservation {
        /// Binary weekday mask, e.g. "0011111"
        #[clap(value_parser = parse_days)]
        days: u8,
        /// Start time, e.g. "22:00"
        #[clap(value_parser = parse_time)]
        start: NaiveTime,
        /// End time
        #[clap(value_parser = parse_time)]
        end: NaiveTime,
    },
    /// Enable or disable the bluetooth connection mode
    SetBluetooth {
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Enable or disable the emergency stop protection
    SetEmergencyStopProtection {
        #[clap(long, short, action)]
        enable: bool,
    },
    /// Set the WiFi network the charger joins
    SetWifi { ssid: String, password: String },
    /// Set the charger clock to the local time
    SetTime,
    /// Change the charger password (decimal)
    ChangePassword { new_password: u32 },
    /// Switch the charger into firmware update mode (Use with caution!)
    SwitchIapMode,
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (e.g., model,faults,realtime,controls,records or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "faults,realtime")]
        metrics: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "EV charger command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Charger address, a broadcast address reaches every charger in the network
    #[arg(long, default_value = "255.255.255.255")]
    pub host: String,

    /// UDP port of the charger
    #[arg(short, long, default_value_t = session::DEFAULT_PORT)]
    pub port: u16,

    /// Local UDP port the charger answers to
    #[arg(long, default_value_t = session::DEFAULT_PORT)]
    pub local_port: u16,

    /// Charger password (decimal), the factory default is used if not given
    #[arg(long, env = "EVCHARGER_PASSWORD")]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Response timeout per command (e.g., "500ms", "1s", "2s 500ms"), "0s" waits forever
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,
}

impl CliArgs {
    pub fn session_config(&self) -> session::SessionConfig {
        session::SessionConfig {
            host: self.host.clone(),
            port: self.port,
            local_port: self.local_port,
            password: self.password.clone(),
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times() {
        assert_eq!(
            parse_time("22:00").unwrap(),
            NaiveTime::from_hms_opt(22, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("06:30:15").unwrap(),
            NaiveTime::from_hms_opt(6, 30, 15).unwrap()
        );
        assert!(parse_time("25:00").is_err());
    }

    #[test]
    fn days() {
        assert_eq!(parse_days("0011111").unwrap(), 0x1f);
        assert_eq!(parse_days("1").unwrap(), 1);
        assert!(parse_days("10000000").is_err());
        assert!(parse_days("0012").is_err());
        assert!(parse_days("").is_err());
    }

    #[test]
    fn session_config_from_arguments() {
        let args = CliArgs::parse_from([
            "evcharger",
            "--host",
            "192.168.1.20",
            "--password",
            "888888",
            "--timeout",
            "2s",
            "set-max-current",
            "16",
        ]);
        assert_eq!(args.command, CliCommands::SetMaxCurrent { amps: 16 });
        let config = args.session_config();
        assert_eq!(config.host, "192.168.1.20");
        assert_eq!(config.port, session::DEFAULT_PORT);
        assert_eq!(config.password.as_deref(), Some("888888"));
        assert_eq!(config.timeout, Duration::from_secs(2));
    }
}
