use anyhow::{bail, Context, Result};
use clap::Parser;
use evcharger_lib::charger::Charger;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

macro_rules! print_model {
    ($charger:expr) => {
        println!(
            "Model: {:?}",
            $charger
                .get_model()
                .await
                .with_context(|| "Cannot get model")?
        )
    };
}
macro_rules! print_faults {
    ($charger:expr) => {
        println!(
            "Faults: {:?}",
            $charger
                .get_fault_status()
                .await
                .with_context(|| "Cannot get fault status")?
        )
    };
}
macro_rules! print_realtime {
    ($charger:expr) => {
        println!(
            "Real-time data: {:?}",
            $charger
                .get_realtime_data()
                .await
                .with_context(|| "Cannot get real-time data")?
        )
    };
}
macro_rules! print_controls {
    ($charger:expr) => {
        println!(
            "Controls: {:?}",
            $charger
                .get_controls_state()
                .await
                .with_context(|| "Cannot get controls state")?
        )
    };
}
macro_rules! print_records {
    ($charger:expr) => {
        println!(
            "Consumption records: {:?}",
            $charger
                .get_consumption_records()
                .await
                .with_context(|| "Cannot get consumption records")?
        )
    };
}

/// Runs a set command and fails if the charger refuses it.
macro_rules! apply {
    ($call:expr, $what:expr) => {
        if !$call.await.with_context(|| format!("Cannot set {}", $what))? {
            bail!("Charger refused to set {}", $what);
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let charger = Charger::new(args.session_config());

    match args.command {
        CliCommands::Model => print_model!(charger),
        CliCommands::Faults => print_faults!(charger),
        CliCommands::Realtime => {
            let _ = charger.get_model().await.with_context(|| "Cannot get model")?;
            print_realtime!(charger);
        }
        CliCommands::Controls => print_controls!(charger),
        CliCommands::Records => print_records!(charger),
        CliCommands::MonthRecords { year, month } => println!(
            "Consumption of {year}-{month:02}: {:?}",
            charger
                .get_consumption_records_of_month(year, month)
                .await
                .with_context(|| format!("Cannot get consumption records of {year}-{month:02}"))?
        ),
        CliCommands::All => {
            print_model!(charger);
            print_faults!(charger);
            print_realtime!(charger);
            print_controls!(charger);
            print_records!(charger);
        }
        CliCommands::Discover { device_code } => println!(
            "IP address: {:?}",
            charger
                .get_ip_address(&device_code)
                .await
                .with_context(|| format!("Cannot find charger '{device_code}'"))?
        ),
        CliCommands::Heartbeat => charger
            .heartbeat()
            .await
            .with_context(|| "Cannot send heartbeat")?,
        CliCommands::SetCharge { start } => apply!(charger.set_charge_state(start), "charge state"),
        CliCommands::SetTimedCharge { enable, start, end } => apply!(
            charger.set_timed_charge_state(enable, &start, &end),
            "timed charge"
        ),
        CliCommands::SetRfidAndApp { rfid, app } => {
            apply!(charger.set_rfid_and_app(rfid, app), "RFID and app control")
        }
        CliCommands::SetDlb { enable } => apply!(charger.set_dlb(enable), "DLB"),
        CliCommands::SetGroundingDetection { enable } => apply!(
            charger.set_grounding_detection(enable),
            "grounding detection"
        ),
        CliCommands::SetMaxCurrent { amps } => {
            apply!(charger.set_max_current(amps), "max current")
        }
        CliCommands::SetMaxPower { power } => apply!(charger.set_max_power(power), "max power"),
        CliCommands::SetMaxMonthlyPower { power } => apply!(
            charger.set_max_monthly_power(power),
            "max monthly power"
        ),
        CliCommands::SetReservation { days, start, end } => apply!(
            charger.set_reservation(days, &start, &end),
            "reservation"
        ),
        CliCommands::SetBluetooth { enable } => apply!(
            charger.set_bluetooth_connection_mode(enable),
            "bluetooth connection mode"
        ),
        CliCommands::SetEmergencyStopProtection { enable } => apply!(
            charger.set_emergency_stop_protection(enable),
            "emergency stop protection"
        ),
        CliCommands::SetWifi { ssid, password } => apply!(
            charger.set_wifi_access_point(&ssid, &password),
            "WiFi access point"
        ),
        CliCommands::SetTime => apply!(charger.sync_time(), "time"),
        CliCommands::ChangePassword { new_password } => {
            apply!(charger.change_password(new_password), "password")
        }
        CliCommands::SwitchIapMode => charger
            .switch_iap_mode()
            .await
            .with_context(|| "Cannot switch to IAP mode")?,
        CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(charger, output, interval, metrics).await?,
    }

    Ok(())
}
