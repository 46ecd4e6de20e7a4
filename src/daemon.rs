use anyhow::{bail, Context, Result};
use evcharger_lib::charger::Charger;
use evcharger_lib::event::Event;
use evcharger_lib::state;
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;

use crate::{commandline, mqtt};

#[derive(Debug)]
enum FetchedData {
    Model(state::Model),
    FaultStatus(state::FaultStatus),
    RealTimeData(state::RealTimeData),
    ControlsState(state::ControlsState),
    ConsumptionRecords(state::ConsumptionRecords),
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        match self {
            FetchedData::Model(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::FaultStatus(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::RealTimeData(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::ControlsState(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::ConsumptionRecords(s) => serde_json::to_value(s).map_err(Into::into),
        }
    }

    fn as_debug_string(&self) -> String {
        match self {
            FetchedData::Model(s) => format!("{s:?}"),
            FetchedData::FaultStatus(s) => format!("{s:?}"),
            FetchedData::RealTimeData(s) => format!("{s:?}"),
            FetchedData::ControlsState(s) => format!("{s:?}"),
            FetchedData::ConsumptionRecords(s) => format!("{s:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Metric {
    Model,
    Faults,
    Realtime,
    Controls,
    Records,
}

impl Metric {
    const ALL: [Metric; 5] = [
        Metric::Model,
        Metric::Faults,
        Metric::Realtime,
        Metric::Controls,
        Metric::Records,
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|metric| metric.name() == name)
    }

    fn name(self) -> &'static str {
        match self {
            Metric::Model => "model",
            Metric::Faults => "faults",
            Metric::Realtime => "realtime",
            Metric::Controls => "controls",
            Metric::Records => "records",
        }
    }

    /// Metrics whose result has to be known before this one can be fetched.
    fn dependencies(self) -> &'static [Metric] {
        match self {
            Metric::Realtime => &[Metric::Model],
            _ => &[],
        }
    }

    async fn fetch(self, charger: &Charger) -> Result<FetchedData> {
        Ok(match self {
            Metric::Model => FetchedData::Model(charger.get_model().await?),
            Metric::Faults => FetchedData::FaultStatus(charger.get_fault_status().await?),
            Metric::Realtime => FetchedData::RealTimeData(charger.get_realtime_data().await?),
            Metric::Controls => FetchedData::ControlsState(charger.get_controls_state().await?),
            Metric::Records => {
                FetchedData::ConsumptionRecords(charger.get_consumption_records().await?)
            }
        })
    }
}

fn resolve_metrics(names: &[String]) -> Result<Vec<Metric>> {
    if names.iter().any(|name| name == "all") {
        info!("Fetching all metrics due to 'all' flag.");
        return Ok(Metric::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| match Metric::from_name(name) {
            Some(metric) => Ok(metric),
            None => bail!("Unknown metric name '{}'", name),
        })
        .collect()
}

/// Flattens a JSON value into one `(topic, payload)` pair per leaf, nulls are skipped.
fn simple_format(base_topic: &str, metric_name: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn collect(topic: String, val: &serde_json::Value, out: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    collect(format!("{topic}/{k}"), v, out);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    collect(format!("{topic}/{i}"), v, out);
                }
            }
            serde_json::Value::String(s) => out.push((topic, s.clone())),
            serde_json::Value::Number(n) => out.push((topic, n.to_string())),
            serde_json::Value::Bool(b) => out.push((topic, b.to_string())),
            serde_json::Value::Null => {}
        }
    }
    let mut out = Vec::new();
    collect(format!("{base_topic}/{metric_name}"), value, &mut out);
    out
}

/// Logs charger errors and dropped frames while the daemon runs.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(Event::ChargerError(code)) => warn!("Charger reported error code {code}"),
            Ok(Event::Malformed(raw)) => warn!("Dropped malformed frame {raw:?}"),
            Ok(event) => log::trace!("event: {}", event.name()),
            Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} events"),
            Err(RecvError::Closed) => break,
        }
    }
}

pub async fn run(
    charger: Charger,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
    metrics_to_fetch: Vec<String>,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, metrics={metrics_to_fetch:?}"
    );
    let metrics = resolve_metrics(&metrics_to_fetch)?;
    tokio::spawn(log_events(charger.subscribe()));

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let mut fetched_data: HashMap<&str, FetchedData> = HashMap::new();

        for metric in &metrics {
            for dep in metric.dependencies() {
                // the model never changes, fetch it once
                if *dep == Metric::Model && charger.model().is_some() {
                    continue;
                }
                if !fetched_data.contains_key(dep.name()) {
                    info!("Fetching dependency '{}' for '{}'", dep.name(), metric.name());
                    match dep.fetch(&charger).await {
                        Ok(data) => {
                            if metrics.contains(dep) {
                                fetched_data.insert(dep.name(), data);
                            }
                        }
                        Err(e) => error!("Error fetching dependency '{}': {e}", dep.name()),
                    }
                }
            }
            if fetched_data.contains_key(metric.name()) {
                continue;
            }
            info!("Fetching metric: {}", metric.name());
            match metric.fetch(&charger).await {
                Ok(data) => {
                    fetched_data.insert(metric.name(), data);
                }
                Err(e) => error!("Error fetching metric '{}': {e}", metric.name()),
            }
        }

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for (name, data) in &fetched_data {
                    println!("{}: {}", name, data.as_debug_string());
                }
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mqtt_publisher {
                    match format {
                        commandline::MqttFormat::Json => {
                            let mut data_to_publish = serde_json::Map::new();
                            data_to_publish.insert(
                                "timestamp".to_string(),
                                json!(chrono::Utc::now().to_rfc3339()),
                            );

                            for (name, data) in &fetched_data {
                                match data.to_json_value() {
                                    Ok(val) => {
                                        data_to_publish.insert(name.to_string(), val);
                                    }
                                    Err(e) => error!("Failed to serialize '{name}': {e}"),
                                }
                            }

                            if data_to_publish.len() > 1 {
                                match serde_json::to_string(&data_to_publish) {
                                    Ok(json_payload) => {
                                        info!(
                                            "MQTT output: Attempting to publish data: {json_payload}"
                                        );
                                        if let Err(e) = publisher
                                            .publish(publisher.topic(), &json_payload)
                                            .await
                                        {
                                            error!("Failed to publish data to MQTT: {e:?}");
                                        } else {
                                            info!("Successfully published data to MQTT.");
                                        }
                                    }
                                    Err(e) => {
                                        error!("Failed to serialize data to JSON string: {e}");
                                    }
                                }
                            } else {
                                info!("No data fetched in this cycle to publish via MQTT.");
                            }
                        }
                        commandline::MqttFormat::Simple => {
                            let base_topic = publisher.topic();
                            for (name, data) in &fetched_data {
                                let value = match data.to_json_value() {
                                    Ok(value) => value,
                                    Err(e) => {
                                        error!("Failed to serialize '{name}': {e}");
                                        continue;
                                    }
                                };
                                for (topic, payload) in simple_format(base_topic, name, &value) {
                                    if let Err(e) = publisher.publish(&topic, &payload).await {
                                        error!("Failed to publish message to topic {topic}: {e}");
                                    }
                                }
                            }
                        }
                    }
                } else {
                    warn!(
                        "MQTT output selected, but publisher is not initialized. Skipping publish."
                    );
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names() {
        let names = vec![String::from("realtime"), String::from("faults")];
        assert_eq!(
            resolve_metrics(&names).unwrap(),
            vec![Metric::Realtime, Metric::Faults]
        );
        assert_eq!(
            resolve_metrics(&[String::from("all")]).unwrap().len(),
            Metric::ALL.len()
        );
        assert!(resolve_metrics(&[String::from("soc")]).is_err());
        assert_eq!(Metric::Realtime.dependencies(), &[Metric::Model]);
    }

    #[test]
    fn simple_format_flattens_values() {
        let value = json!({
            "power": 3.6,
            "state": "Charging",
            "electrical": { "OnePhase": { "current": 16 } },
            "years": [1, 2],
            "is_maximum": null,
        });
        let mut published = simple_format("evcharger", "realtime", &value);
        published.sort();
        assert_eq!(
            published,
            vec![
                (
                    String::from("evcharger/realtime/electrical/OnePhase/current"),
                    String::from("16")
                ),
                (String::from("evcharger/realtime/power"), String::from("3.6")),
                (
                    String::from("evcharger/realtime/state"),
                    String::from("Charging")
                ),
                (String::from("evcharger/realtime/years/0"), String::from("1")),
                (String::from("evcharger/realtime/years/1"), String::from("2")),
            ]
        );
    }
}
