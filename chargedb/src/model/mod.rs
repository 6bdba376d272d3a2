// Typed documents and view rows for the analytics database

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CHARGING_SESSIONS: &str = "charging_sessions";
pub const SIMULATIONS: &str = "simulations";
pub const AGENT_METRICS: &str = "agent_metrics";
pub const INFRASTRUCTURE: &str = "infrastructure";
pub const DAILY_STATS: &str = "daily_stats";
pub const AGENT_PERFORMANCE: &str = "agent_performance";

/// `_id` of the infrastructure singleton
pub const INFRASTRUCTURE_ID: &str = "iquitos_ev_mall";

/// Grid carbon intensity of the Iquitos thermal grid, kg CO2 per kWh
pub const CARBON_INTENSITY_KG_KWH: f64 = 0.4521;

/// A stored document: its `_id` and typed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    pub id: String,
    pub data: T,
}

impl<T: DeserializeOwned> Document<T> {
    /// Split a raw document into `_id` and typed data.
    pub fn from_value(mut value: Value) -> Result<Self> {
        let id = match value.as_object_mut().and_then(|o| o.remove("_id")) {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Ok(Document {
            id,
            data: serde_json::from_value(value)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Moto,
    Mototaxi,
}

/// Parking zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Playa {
    #[serde(rename = "Playa_Motos")]
    Motos,
    #[serde(rename = "Playa_Mototaxis")]
    Mototaxis,
}

impl Playa {
    /// The vehicle class a zone serves
    pub fn vehicle_type(&self) -> VehicleType {
        match self {
            Playa::Motos => VehicleType::Moto,
            Playa::Mototaxis => VehicleType::Mototaxi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Agent {
    #[serde(rename = "SAC")]
    Sac,
    #[serde(rename = "PPO")]
    Ppo,
    #[serde(rename = "A2C")]
    A2c,
    Uncontrolled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub charger_id: u32,
    pub vehicle_type: VehicleType,
    pub playa: Playa,
    pub energy_kwh: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2_kg: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ChargingSession {
    /// Fill `co2_kg` from the delivered energy and a grid carbon intensity.
    pub fn with_grid_emissions(mut self, intensity_kg_kwh: f64) -> Self {
        self.co2_kg = Some(self.energy_kwh * intensity_kg_kwh);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub agent: Agent,
    pub episodes: u32,
    pub total_reward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2_emissions_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solar_utilization_pct: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Free-form per-episode metrics. Only the lookup keys are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetric {
    pub agent_name: String,
    pub episode: u32,
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayaPlant {
    pub chargers: u32,
    pub charger_power_kw: f64,
    pub total_power_kw: f64,
    pub pv_kwp: f64,
    pub bess_kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantTotals {
    pub chargers: u32,
    pub power_kw: f64,
    pub pv_kwp: f64,
    pub bess_kwh: f64,
}

/// Multi-objective weights used by the optimization agents
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub co2: f64,
    pub cost: f64,
    pub solar: f64,
    pub ev: f64,
    pub grid: f64,
}

impl ObjectiveWeights {
    pub fn total(&self) -> f64 {
        self.co2 + self.cost + self.solar + self.ev + self.grid
    }

    /// Whether the weights sum to 1.0 within 0.01
    pub fn is_normalized(&self) -> bool {
        (self.total() - 1.0).abs() <= 0.01
    }
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        ObjectiveWeights {
            co2: 0.35,
            cost: 0.10,
            solar: 0.20,
            ev: 0.30,
            grid: 0.05,
        }
    }
}

/// The infrastructure singleton: plant description, tariff and weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureConfig {
    #[serde(rename = "_id")]
    pub id: String,
    pub location: Location,
    pub playas: BTreeMap<Playa, PlayaPlant>,
    pub totals: PlantTotals,
    pub carbon_intensity_kg_kwh: f64,
    pub tariff_usd_kwh: f64,
    pub weights: ObjectiveWeights,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfrastructureConfig {
    /// The Iquitos mall plant as commissioned
    pub fn iquitos(now: DateTime<Utc>) -> Self {
        let motos = PlayaPlant {
            chargers: 112,
            charger_power_kw: 2.0,
            total_power_kw: 224.0,
            pv_kwp: 3641.8,
            bess_kwh: 1750.0,
        };
        let mototaxis = PlayaPlant {
            chargers: 16,
            charger_power_kw: 3.0,
            total_power_kw: 48.0,
            pv_kwp: 520.2,
            bess_kwh: 250.0,
        };
        let totals = PlantTotals {
            chargers: motos.chargers + mototaxis.chargers,
            power_kw: motos.total_power_kw + mototaxis.total_power_kw,
            pv_kwp: 4162.0,
            bess_kwh: motos.bess_kwh + mototaxis.bess_kwh,
        };

        InfrastructureConfig {
            id: INFRASTRUCTURE_ID.to_string(),
            location: Location {
                city: "Iquitos".into(),
                country: "Peru".into(),
                lat: -3.75,
                lon: -73.25,
                timezone: "America/Lima".into(),
            },
            playas: BTreeMap::from([(Playa::Motos, motos), (Playa::Mototaxis, mototaxis)]),
            totals,
            carbon_intensity_kg_kwh: CARBON_INTENSITY_KG_KWH,
            tariff_usd_kwh: 0.20,
            weights: ObjectiveWeights::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Key of a `daily_stats` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayZone {
    pub date: Option<String>,
    pub playa: Option<Playa>,
}

/// A row of the `daily_stats` view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStatsRow {
    #[serde(rename = "_id")]
    pub key: DayZone,
    pub sessions: u64,
    pub total_energy_kwh: f64,
    pub total_co2_kg: f64,
    pub avg_duration_min: Option<f64>,
}

/// A row of the `agent_performance` view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformanceRow {
    #[serde(rename = "_id")]
    pub agent: Agent,
    pub runs: u64,
    pub avg_reward: Option<f64>,
    pub avg_co2_kg: Option<f64>,
    pub avg_solar_pct: Option<f64>,
    pub max_reward: Option<f64>,
    pub min_co2_kg: Option<f64>,
}
