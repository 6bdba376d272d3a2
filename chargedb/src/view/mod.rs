use crate::error::{ChargeDbError, Result};
use crate::schema::{
    Accumulator, DateBucket, Direction, GroupBy, GroupKey, GroupStage, SchemaDefinition,
    SortKey, Stage, ViewDefinition,
};
use crate::util::{compare_values, is_safe_path, lookup_path};
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// A named, read-only virtual collection: a source collection plus a pipeline.
/// Rows are computed from the current source documents on every read.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationView {
    pub name: String,
    pub source: String,
    pub pipeline: Vec<Stage>,
}

impl AggregationView {
    /// Check a view declaration against the known collections
    pub fn build(
        name: &str,
        definition: &ViewDefinition,
        collections: &HashSet<&str>,
    ) -> Result<Self> {
        if !collections.contains(definition.source.as_str()) {
            return Err(ChargeDbError::Schema(format!(
                "View '{name}': source collection '{}' is not declared",
                definition.source
            )));
        }
        if collections.contains(name) {
            return Err(ChargeDbError::Schema(format!(
                "View '{name}' has the same name as a collection"
            )));
        }
        for stage in &definition.pipeline {
            check_stage(name, stage)?;
        }

        Ok(AggregationView {
            name: name.to_string(),
            source: definition.source.clone(),
            pipeline: definition.pipeline.clone(),
        })
    }

    pub fn definition(&self) -> ViewDefinition {
        ViewDefinition {
            source: self.source.clone(),
            pipeline: self.pipeline.clone(),
        }
    }

    /// Run the pipeline over the source documents
    pub fn execute<'a, I>(&'a self, docs: I) -> Vec<Value>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: 'a,
    {
        execute_pipeline(&self.pipeline, docs)
    }
}

/// Build every view declared in a schema
pub fn build_views(schema: &SchemaDefinition) -> Result<Vec<AggregationView>> {
    let collections: HashSet<&str> = schema.collections.keys().map(String::as_str).collect();
    schema
        .views
        .iter()
        .map(|(name, def)| AggregationView::build(name, def, &collections))
        .collect()
}

fn check_stage(view: &str, stage: &Stage) -> Result<()> {
    let fail = |msg: String| Err(ChargeDbError::Schema(format!("View '{view}': {msg}")));
    match stage {
        Stage::Group(group) => {
            let fields: Vec<&str> = match &group.by {
                GroupBy::Field(f) => vec![f.as_str()],
                GroupBy::Keys(keys) => keys.values().map(GroupKey::field).collect(),
            };
            for field in fields
                .into_iter()
                .chain(group.accumulate.values().filter_map(Accumulator::field))
            {
                if !is_safe_path(field) {
                    return fail(format!("invalid field path '{field}'"));
                }
            }
            if group.accumulate.contains_key("_id") {
                return fail("accumulator may not be named '_id'".into());
            }
            Ok(())
        }
        Stage::Sort(keys) if keys.is_empty() => fail("sort needs at least one key".into()),
        Stage::Limit(0) => fail("limit must be positive".into()),
        _ => Ok(()),
    }
}

/// Run a pipeline over a stream of documents. Match and limit stream; group and
/// sort need the whole input and materialize it.
pub fn execute_pipeline<'a, I>(pipeline: &'a [Stage], docs: I) -> Vec<Value>
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: 'a,
{
    let mut rows: Box<dyn Iterator<Item = Value> + 'a> = Box::new(docs.into_iter());

    for stage in pipeline {
        rows = match stage {
            Stage::Match(criteria) => Box::new(rows.filter(move |doc| matches(doc, criteria))),
            Stage::Limit(n) => Box::new(rows.take(*n)),
            Stage::Group(group) => Box::new(run_group(group, rows).into_iter()),
            Stage::Sort(keys) => {
                let mut sorted: Vec<Value> = rows.collect();
                sort_rows(&mut sorted, keys);
                Box::new(sorted.into_iter())
            }
        };
    }

    rows.collect()
}

fn matches(doc: &Value, criteria: &BTreeMap<String, Value>) -> bool {
    criteria.iter().all(|(field, expected)| {
        let actual = lookup_path(doc, field).unwrap_or(&Value::Null);
        compare_values(actual, expected) == Ordering::Equal
    })
}

/// Stable multi-key sort
pub fn sort_rows(rows: &mut [Value], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let left = lookup_path(a, &key.field).unwrap_or(&Value::Null);
            let right = lookup_path(b, &key.field).unwrap_or(&Value::Null);
            let ord = match key.direction {
                Direction::Ascending => compare_values(left, right),
                Direction::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[derive(Debug)]
enum AccState {
    Count(u64),
    Sum(f64),
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Count => AccState::Count(0),
            Accumulator::Sum(_) => AccState::Sum(0.0),
            Accumulator::Avg(_) => AccState::Avg { total: 0.0, n: 0 },
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
        }
    }

    fn push(&mut self, value: Option<&Value>) {
        let value = value.filter(|v| !v.is_null());
        match self {
            AccState::Count(n) => *n += 1,
            AccState::Sum(total) => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *total += x;
                }
            }
            AccState::Avg { total, n } => {
                if let Some(x) = value.and_then(Value::as_f64) {
                    *total += x;
                    *n += 1;
                }
            }
            AccState::Min(current) => {
                if let Some(v) = value {
                    if current.as_ref().map_or(true, |c| compare_values(v, c) == Ordering::Less) {
                        *current = Some(v.clone());
                    }
                }
            }
            AccState::Max(current) => {
                if let Some(v) = value {
                    if current
                        .as_ref()
                        .map_or(true, |c| compare_values(v, c) == Ordering::Greater)
                    {
                        *current = Some(v.clone());
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Count(n) => Value::from(n),
            AccState::Sum(total) => float(total),
            AccState::Avg { n: 0, .. } => Value::Null,
            AccState::Avg { total, n } => float(total / n as f64),
            AccState::Min(v) | AccState::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

fn float(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

struct Group {
    id: Value,
    states: Vec<(String, AccState)>,
}

fn run_group<I>(stage: &GroupStage, docs: I) -> Vec<Value>
where
    I: Iterator<Item = Value>,
{
    // Keyed by the serialized _id so equal keys of any shape land together
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for doc in docs {
        let id = group_id(&stage.by, &doc);
        let key = id.to_string();
        let group = groups.entry(key).or_insert_with(|| Group {
            id,
            states: stage
                .accumulate
                .iter()
                .map(|(name, acc)| (name.clone(), AccState::new(acc)))
                .collect(),
        });

        for ((_, state), acc) in group.states.iter_mut().zip(stage.accumulate.values()) {
            state.push(acc.field().and_then(|f| lookup_path(&doc, f)));
        }
    }

    groups
        .into_values()
        .map(|group| {
            let mut row = Map::new();
            row.insert("_id".to_string(), group.id);
            for (name, state) in group.states {
                row.insert(name, state.finish());
            }
            Value::Object(row)
        })
        .collect()
}

fn group_id(by: &GroupBy, doc: &Value) -> Value {
    match by {
        GroupBy::Field(field) => lookup_path(doc, field).cloned().unwrap_or(Value::Null),
        GroupBy::Keys(keys) => {
            let mut id = Map::new();
            for (name, key) in keys {
                let value = match key {
                    GroupKey::Field(field) => lookup_path(doc, field).cloned(),
                    GroupKey::Bucketed { field, bucket } => {
                        lookup_path(doc, field).and_then(|v| bucket_date(v, *bucket))
                    }
                };
                id.insert(name.clone(), value.unwrap_or(Value::Null));
            }
            Value::Object(id)
        }
    }
}

fn bucket_date(value: &Value, bucket: DateBucket) -> Option<Value> {
    let parsed = DateTime::parse_from_rfc3339(value.as_str()?).ok()?;
    let utc: DateTime<Utc> = parsed.with_timezone(&Utc);
    Some(Value::String(utc.format(bucket.format()).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn views() -> Vec<AggregationView> {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  charging_sessions: {}
  simulations: {}
views:
  daily_stats:
    source: charging_sessions
    pipeline:
      - group:
          by:
            date: { field: timestamp, bucket: day }
            playa: playa
          accumulate:
            sessions: count
            total_energy_kwh: { sum: energy_kwh }
            total_co2_kg: { sum: co2_kg }
            avg_duration_min: { avg: duration_minutes }
      - sort: ["-_id.date", "_id.playa"]
  agent_performance:
    source: simulations
    pipeline:
      - group:
          by: agent
          accumulate:
            runs: count
            avg_reward: { avg: total_reward }
            avg_co2_kg: { avg: co2_emissions_kg }
            max_reward: { max: total_reward }
            min_co2_kg: { min: co2_emissions_kg }
      - sort: [avg_co2_kg]
"#,
        )
        .unwrap();
        build_views(&schema).unwrap()
    }

    fn view(name: &str) -> AggregationView {
        views().into_iter().find(|v| v.name == name).unwrap()
    }

    #[test]
    fn test_daily_stats_groups_by_day_and_playa() {
        let rows = view("daily_stats").execute(vec![
            json!({ "playa": "Playa_Motos", "energy_kwh": 2.0, "timestamp": "2024-03-01T08:00:00Z", "duration_minutes": 30 }),
            json!({ "playa": "Playa_Motos", "energy_kwh": 3.0, "timestamp": "2024-03-01T19:30:00Z", "duration_minutes": 50 }),
        ]);

        assert_eq!(
            rows,
            vec![json!({
                "_id": { "date": "2024-03-01", "playa": "Playa_Motos" },
                "sessions": 2,
                "total_energy_kwh": 5.0,
                "total_co2_kg": 0.0,
                "avg_duration_min": 40.0
            })]
        );
    }

    #[test]
    fn test_daily_stats_orders_days_descending() {
        let rows = view("daily_stats").execute(vec![
            json!({ "playa": "Playa_Motos", "energy_kwh": 1.0, "timestamp": "2024-03-01T08:00:00Z" }),
            json!({ "playa": "Playa_Mototaxis", "energy_kwh": 4.0, "timestamp": "2024-03-02T08:00:00Z" }),
            json!({ "playa": "Playa_Motos", "energy_kwh": 1.5, "timestamp": "2024-03-02T09:00:00Z" }),
        ]);

        let keys: Vec<(String, String)> = rows
            .iter()
            .map(|r| {
                (
                    r["_id"]["date"].as_str().unwrap().to_string(),
                    r["_id"]["playa"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("2024-03-02".to_string(), "Playa_Motos".to_string()),
                ("2024-03-02".to_string(), "Playa_Mototaxis".to_string()),
                ("2024-03-01".to_string(), "Playa_Motos".to_string()),
            ]
        );
        // No durations recorded: the mean is null rather than zero
        assert_eq!(rows[0]["avg_duration_min"], Value::Null);
    }

    #[test]
    fn test_day_bucket_uses_utc() {
        let rows = view("daily_stats").execute(vec![json!({
            "playa": "Playa_Motos",
            "energy_kwh": 1.0,
            "timestamp": "2024-03-01T22:00:00-05:00"
        })]);
        assert_eq!(rows[0]["_id"]["date"], json!("2024-03-02"));
    }

    #[test]
    fn test_agent_performance_orders_by_mean_co2() {
        let rows = view("agent_performance").execute(vec![
            json!({ "agent": "SAC", "episodes": 10, "total_reward": 100.0, "co2_emissions_kg": 10.0 }),
            json!({ "agent": "PPO", "episodes": 10, "total_reward": 80.0, "co2_emissions_kg": 5.0 }),
        ]);

        let agents: Vec<&str> = rows.iter().map(|r| r["_id"].as_str().unwrap()).collect();
        assert_eq!(agents, vec!["PPO", "SAC"]);
        assert_eq!(rows[1]["max_reward"], json!(100.0));
        assert_eq!(rows[1]["runs"], json!(1));
    }

    #[test]
    fn test_agent_performance_aggregates_runs() {
        let rows = view("agent_performance").execute(vec![
            json!({ "agent": "A2C", "total_reward": 10.0, "co2_emissions_kg": 8.0 }),
            json!({ "agent": "A2C", "total_reward": 30.0, "co2_emissions_kg": 4.0 }),
            json!({ "agent": "A2C", "total_reward": 20 }),
        ]);

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["runs"], json!(3));
        assert_eq!(row["avg_reward"], json!(20.0));
        assert_eq!(row["avg_co2_kg"], json!(6.0));
        assert_eq!(row["max_reward"], json!(30.0));
        assert_eq!(row["min_co2_kg"], json!(4.0));
    }

    #[test]
    fn test_empty_source_yields_no_rows() {
        assert!(view("daily_stats").execute(Vec::new()).is_empty());
    }

    #[test]
    fn test_match_and_limit_stages() {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  simulations: {}
views:
  best_sac:
    source: simulations
    pipeline:
      - match: { agent: SAC }
      - sort: ["-total_reward"]
      - limit: 1
"#,
        )
        .unwrap();
        let view = build_views(&schema).unwrap().remove(0);
        let rows = view.execute(vec![
            json!({ "agent": "SAC", "total_reward": 1 }),
            json!({ "agent": "PPO", "total_reward": 99 }),
            json!({ "agent": "SAC", "total_reward": 7 }),
        ]);
        assert_eq!(rows, vec![json!({ "agent": "SAC", "total_reward": 7 })]);
    }

    #[test]
    fn test_view_source_must_exist() {
        let schema = parse_schema_str(
            r#"
database: test
collections:
  simulations: {}
views:
  orphan:
    source: sessions
    pipeline: []
"#,
        )
        .unwrap();
        let err = build_views(&schema).unwrap_err();
        assert!(err.to_string().contains("'sessions' is not declared"));
    }
}
