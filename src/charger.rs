//! Provides a high-level asynchronous client for an EV charger reachable over UDP.
//!
//! Every protocol command has one method. Query methods decode the reply into the
//! typed snapshots of [`crate::state`], keep the latest one and publish it as an
//! [`Event`]. Set methods return whether the charger acknowledged the change.
//!
//! # Example
//!
//! ```no_run
//! use evcharger_lib::charger::Charger;
//! use evcharger_lib::session::SessionConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), evcharger_lib::Error> {
//!     let charger = Charger::new(SessionConfig::new("192.168.1.20"));
//!
//!     // The model has to be known before real-time data can be decoded.
//!     let model = charger.get_model().await?;
//!     println!("Model: {model:?}");
//!
//!     let data = charger.get_realtime_data().await?;
//!     println!("Power: {} kW, state: {:?}", data.power, data.state);
//!
//!     if !charger.set_charge_state(true).await? {
//!         eprintln!("charger refused to start charging");
//!     }
//!     Ok(())
//! }
//! ```

use crate::event::Event;
use crate::protocol::{decode_boolean, Credential, Message, Request};
use crate::session::{CommandSession, Expect, SessionConfig};
use crate::state::*;
use crate::transport::{Transport, UdpTransport};
use crate::Error;
use chrono::{Datelike, NaiveTime, Timelike};
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default)]
struct Snapshots {
    model: Option<Model>,
    fault_status: Option<FaultStatus>,
    realtime_data: Option<RealTimeData>,
    controls_state: Option<ControlsState>,
}

/// Asynchronous client for one charger.
///
/// All methods take `&self`, so a `Charger` can be shared between tasks (e.g. in an
/// `Arc`) and several commands may be in flight at the same time.
pub struct Charger<T: Transport = UdpTransport> {
    session: CommandSession<T>,
    snapshots: RwLock<Snapshots>,
}

impl Charger<UdpTransport> {
    /// Creates a client talking UDP to `config.host`. The socket is bound on first use.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_session(CommandSession::new(config))
    }
}

impl<T: Transport> Charger<T> {
    pub fn with_session(session: CommandSession<T>) -> Self {
        Self {
            session,
            snapshots: RwLock::new(Snapshots::default()),
        }
    }

    pub fn session(&self) -> &CommandSession<T> {
        &self.session
    }

    /// Subscribes to the events of this charger, see [`Event`].
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.session.subscribe()
    }

    /// Sets the response timeout per command, `Duration::ZERO` waits forever.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(timeout);
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Last model read by [`Charger::get_model`].
    pub fn model(&self) -> Option<Model> {
        self.snapshots.read().model.clone()
    }

    pub fn fault_status(&self) -> Option<FaultStatus> {
        self.snapshots.read().fault_status.clone()
    }

    pub fn realtime_data(&self) -> Option<RealTimeData> {
        self.snapshots.read().realtime_data.clone()
    }

    pub fn controls_state(&self) -> Option<ControlsState> {
        self.snapshots.read().controls_state.clone()
    }

    async fn query(&self, request: Request) -> Result<Message> {
        self.session.request(&request.to_hex(), Expect::response()).await
    }

    async fn acknowledge(&self, request: Request) -> Result<bool> {
        let command = request.command();
        let accepted = decode_boolean(&self.query(request).await?.data);
        if !accepted {
            log::warn!("Charger refused {command}");
        }
        Ok(accepted)
    }

    /// Sends a heartbeat. The charger does not answer it.
    pub async fn heartbeat(&self) -> Result<()> {
        log::trace!("heartbeat");
        self.session.send(&Request::heartbeat().to_hex()).await
    }

    /// Changes the password of the charger.
    ///
    /// On acknowledgement all following commands use the new password and
    /// [`Event::PasswordChanged`] is published.
    pub async fn change_password(&self, password: u32) -> Result<bool> {
        log::trace!("change password");
        let credential = Credential::new(password);
        let accepted = self.acknowledge(Request::change_password(&credential)).await?;
        if accepted {
            self.session.set_credential(credential);
            self.session.emit(Event::PasswordChanged);
        }
        Ok(accepted)
    }

    /// Asks for the IP address of the charger with `device_code`.
    ///
    /// With a broadcast host every charger in the network may answer, only the reply of
    /// the charger with the requested device code is accepted.
    pub async fn get_ip_address(&self, device_code: &str) -> Result<IpAddress> {
        log::trace!("get IP address of {device_code}");
        let wanted = device_code.to_string();
        let expect = Expect::response()
            .predicate(move |message| IpAddress::decode(&message.data).device_code == wanted);
        let message = self
            .session
            .request(&Request::ip_address(device_code).to_hex(), expect)
            .await?;
        let address = IpAddress::decode(&message.data);
        self.session.emit(Event::IpResolved(address.clone()));
        Ok(address)
    }

    /// Reads the model and with it the phase count needed by [`Charger::get_realtime_data`].
    pub async fn get_model(&self) -> Result<Model> {
        log::trace!("get model");
        let model = Model::decode(&self.query(Request::model()).await?.data);
        self.snapshots.write().model = Some(model.clone());
        Ok(model)
    }

    /// Configures the WiFi network the charger joins. SSID and password are limited to
    /// 255 bytes each.
    pub async fn set_wifi_access_point(&self, ssid: &str, password: &str) -> Result<bool> {
        log::trace!("set WiFi access point {ssid}");
        self.acknowledge(Request::wifi_access_point(ssid, password)?)
            .await
    }

    /// Starts (`true`) or stops (`false`) charging.
    pub async fn set_charge_state(&self, start: bool) -> Result<bool> {
        log::trace!("set charge state {start}");
        self.acknowledge(Request::charge_state(start)).await
    }

    pub async fn set_timed_charge_state(
        &self,
        enable: bool,
        start: &NaiveTime,
        end: &NaiveTime,
    ) -> Result<bool> {
        log::trace!("set timed charge {enable} {start} - {end}");
        self.acknowledge(Request::timed_charge_state(enable, start, end))
            .await
    }

    pub async fn set_rfid_and_app(&self, rfid: bool, app: bool) -> Result<bool> {
        log::trace!("set RFID {rfid} app {app}");
        self.acknowledge(Request::rfid_and_app(rfid, app)).await
    }

    /// Dynamic load balancing.
    pub async fn set_dlb(&self, enable: bool) -> Result<bool> {
        log::trace!("set DLB {enable}");
        self.acknowledge(Request::dlb(enable)).await
    }

    pub async fn set_grounding_detection(&self, enable: bool) -> Result<bool> {
        log::trace!("set grounding detection {enable}");
        self.acknowledge(Request::grounding_detection(enable)).await
    }

    /// Maximum charge current in ampere.
    pub async fn set_max_current(&self, amps: u8) -> Result<bool> {
        log::trace!("set max current {amps}");
        self.acknowledge(Request::max_current(amps)).await
    }

    pub async fn get_fault_status(&self) -> Result<FaultStatus> {
        log::trace!("get fault status");
        let status = FaultStatus::decode(&self.query(Request::fault_status()).await?.data);
        self.snapshots.write().fault_status = Some(status.clone());
        self.session.emit(Event::FaultStatus(status.clone()));
        Ok(status)
    }

    /// Reads the electrical values and the charge state.
    ///
    /// # Errors
    ///
    /// [`Error::ChargerModeUnknown`] if [`Charger::get_model`] has not succeeded before,
    /// the payload layout depends on the phase count.
    pub async fn get_realtime_data(&self) -> Result<RealTimeData> {
        log::trace!("get real-time data");
        let mode = self
            .snapshots
            .read()
            .model
            .as_ref()
            .map(|model| model.mode)
            .ok_or(Error::ChargerModeUnknown)?;
        let data = RealTimeData::decode(&self.query(Request::realtime_data()).await?.data, mode);
        self.snapshots.write().realtime_data = Some(data.clone());
        self.session.emit(Event::RealTimeData(data.clone()));
        Ok(data)
    }

    pub async fn get_controls_state(&self) -> Result<ControlsState> {
        log::trace!("get controls state");
        let state = ControlsState::decode(&self.query(Request::controls_state()).await?.data);
        self.snapshots.write().controls_state = Some(state.clone());
        self.session.emit(Event::ControlsState(state.clone()));
        Ok(state)
    }

    pub async fn set_bluetooth_connection_mode(&self, enable: bool) -> Result<bool> {
        log::trace!("set bluetooth connection mode {enable}");
        self.acknowledge(Request::bluetooth_connection_mode(enable))
            .await
    }

    /// Switches the charger into firmware update mode. The charger does not answer.
    pub async fn switch_iap_mode(&self) -> Result<()> {
        log::trace!("switch to IAP mode");
        self.session.send(&Request::switch_iap_mode().to_hex()).await
    }

    /// Maximum charge power in kW.
    pub async fn set_max_power(&self, power: u8) -> Result<bool> {
        log::trace!("set max power {power}");
        self.acknowledge(Request::max_power(power)).await
    }

    /// Reserves charging on the weekdays of the 7 bit mask `days` between `start` and `end`.
    pub async fn set_reservation(&self, days: u8, start: &NaiveTime, end: &NaiveTime) -> Result<bool> {
        log::trace!("set reservation {days:07b} {start} - {end}");
        self.acknowledge(Request::reservation(days, start, end)?)
            .await
    }

    /// Sets the clock of the charger.
    pub async fn set_time<D: Datelike + Timelike>(&self, now: &D) -> Result<bool> {
        log::trace!("set time");
        self.acknowledge(Request::time_sync(now)).await
    }

    /// Sets the clock of the charger to the local time of this host.
    pub async fn sync_time(&self) -> Result<bool> {
        log::trace!("sync time");
        self.acknowledge(Request::time_sync_now()).await
    }

    pub async fn get_consumption_records(&self) -> Result<ConsumptionRecords> {
        log::trace!("get consumption records");
        Ok(ConsumptionRecords::decode(
            &self.query(Request::consumption_records()).await?.data,
        ))
    }

    /// Maximum energy per month in kWh.
    pub async fn set_max_monthly_power(&self, power: u16) -> Result<bool> {
        log::trace!("set max monthly power {power}");
        self.acknowledge(Request::max_monthly_power(power)).await
    }

    pub async fn set_emergency_stop_protection(&self, enable: bool) -> Result<bool> {
        log::trace!("set emergency stop protection {enable}");
        self.acknowledge(Request::emergency_stop_protection(enable))
            .await
    }

    /// Reads the daily consumption of one month.
    ///
    /// # Errors
    ///
    /// [`Error::RangeError`] for a year outside 2000..2100 or a month outside 1..=12.
    pub async fn get_consumption_records_of_month(
        &self,
        year: i32,
        month: u32,
    ) -> Result<ConsumptionRecordsOfMonth> {
        log::trace!("get consumption records of {year}-{month:02}");
        let request = Request::consumption_records_of_month(year, month)?;
        ConsumptionRecordsOfMonth::decode(&self.query(request).await?.data, year, month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_string, reply};
    use crate::transport::mock::MockTransport;

    // the command code follows header, session id, length and credential
    fn command_of(frame: &str) -> &str {
        &frame[18..20]
    }

    fn payload_of(frame: &str) -> &str {
        &frame[20..frame.len() - 2]
    }

    fn charger<F>(responder: F) -> Charger<MockTransport>
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        let transport = MockTransport::new(move |frame| {
            responder(command_of(frame), payload_of(frame))
                .map(|data| vec![reply(&format!("{}{data}", command_of(frame)))])
                .unwrap_or_default()
        });
        Charger::with_session(CommandSession::with_transport(
            transport,
            SessionConfig::new("192.168.1.20"),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_data_requires_model() {
        let charger = charger(|command, _| match command {
            "04" => Some(String::from("03455653453232")),
            "70" => Some(String::from(
                "0a0b0c00e600e700e8006e0100740300000000000000",
            )),
            _ => None,
        });
        assert!(matches!(
            charger.get_realtime_data().await,
            Err(Error::ChargerModeUnknown)
        ));
        // nothing was sent without a known mode
        assert!(charger.session().transport().sent.lock().is_empty());

        let model = charger.get_model().await.unwrap();
        assert_eq!(model.mode, ChargerMode::ThreePhase);
        assert_eq!(model.name, "EVSE22");
        assert_eq!(charger.model(), Some(model));

        let mut events = charger.subscribe();
        let data = charger.get_realtime_data().await.unwrap();
        assert_eq!(
            data.electrical,
            Electrical::ThreePhase {
                currents: [10, 11, 12],
                voltages: [230, 231, 232]
            }
        );
        assert_eq!(data.max_current, None);
        assert_eq!(charger.realtime_data(), Some(data.clone()));
        loop {
            match events.recv().await.unwrap() {
                Event::RealTimeData(published) => {
                    assert_eq!(published, data);
                    break;
                }
                Event::Message(_) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_replaced() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let charger = charger(move |command, _| match command {
            "6e" if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 => {
                Some("01".repeat(12))
            }
            "6e" => Some("00".repeat(14)),
            _ => None,
        });
        assert!(charger.fault_status().is_none());
        assert!(charger.get_fault_status().await.unwrap().has_fault());
        assert!(charger.fault_status().unwrap().has_fault());

        let status = charger.get_fault_status().await.unwrap();
        assert!(!status.has_fault());
        assert_eq!(status.contactor, Some(false));
        assert_eq!(charger.fault_status(), Some(status));
    }

    #[tokio::test(start_paused = true)]
    async fn set_commands_report_acknowledgement() {
        let charger = charger(|command, payload| match command {
            "06" => Some(String::from("01")),
            "6d" if payload == "20" => Some(String::from("01")),
            "6d" => Some(String::from("00")),
            _ => None,
        });
        assert!(charger.set_charge_state(true).await.unwrap());
        assert!(charger.set_max_current(32).await.unwrap());
        assert!(!charger.set_max_current(80).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_arguments_are_not_sent() {
        let charger = charger(|_, _| Some(String::from("01")));
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert!(matches!(
            charger.get_consumption_records_of_month(2024, 13).await,
            Err(Error::RangeError)
        ));
        assert!(matches!(
            charger.set_reservation(0x80, &noon, &noon).await,
            Err(Error::RangeError)
        ));
        assert!(charger.session().transport().sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn password_change_updates_credential() {
        let charger = charger(|command, payload| match command {
            "02" if payload == "000d9038" => Some(String::from("01")),
            "02" => Some(String::from("00")),
            _ => None,
        });
        let mut events = charger.subscribe();

        assert!(!charger.change_password(1).await.unwrap());
        assert_eq!(charger.session().credential(), Credential::default());

        assert!(charger.change_password(888888).await.unwrap());
        assert_eq!(charger.session().credential(), Credential::new(888888));
        let mut changed = false;
        while let Ok(event) = events.try_recv() {
            changed |= event == Event::PasswordChanged;
        }
        assert!(changed);

        charger.heartbeat().await.unwrap();
        let sent = charger.session().transport().sent.lock().clone();
        let heartbeat = sent.last().unwrap();
        assert_eq!(&heartbeat[10..18], "000d9038");
        assert_eq!(command_of(heartbeat), "01");
    }

    #[tokio::test(start_paused = true)]
    async fn ip_address_of_queried_device() {
        let transport = MockTransport::new(|_| {
            vec![
                reply(&format!("03c0a8010a{}", encode_string("OTHER"))),
                reply(&format!("03c0a8010b{}", encode_string("AB12"))),
            ]
        });
        let charger = Charger::with_session(CommandSession::with_transport(
            transport,
            SessionConfig::default(),
        ));
        let mut events = charger.subscribe();
        let address = charger.get_ip_address("AB12").await.unwrap();
        assert_eq!(address.ip, std::net::Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(address.device_code, "AB12");

        let mut resolved = None;
        while let Ok(event) = events.try_recv() {
            if let Event::IpResolved(address) = event {
                resolved = Some(address);
            }
        }
        assert_eq!(resolved, Some(address));
    }

    #[tokio::test(start_paused = true)]
    async fn consumption_records_of_month() {
        let charger = charger(|command, payload| match (command, payload) {
            ("7a", "2401") => Some("01".to_string() + &"000a".repeat(29)),
            _ => None,
        });
        let records = charger
            .get_consumption_records_of_month(2024, 2)
            .await
            .unwrap();
        assert!(records.is_effective);
        assert_eq!(records.days, vec![1.0; 29]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out() {
        let mut charger = charger(|_, _| None);
        charger.set_timeout(Duration::from_millis(100));
        assert!(matches!(
            charger.get_controls_state().await,
            Err(Error::Timeout(_))
        ));
        assert!(charger.controls_state().is_none());
    }
}
