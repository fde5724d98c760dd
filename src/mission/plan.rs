use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::perception::{ColorName, TargetShape};

/// Maximum depth of nested lists and `src` includes.
pub const MAX_PLAN_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("plan {path:?} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("plan nesting exceeds {} levels", MAX_PLAN_DEPTH)]
    TooDeep,

    #[error("plan node is not an action: {0}")]
    NotAnAction(String),

    #[error("invalid plan: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,

    /// Relative altitude; the mission's flight height when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LocalMove {
    /// Relative to the current position
    Offset {
        north: f64,
        east: f64,
        down: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        yaw: Option<f64>,
    },

    /// Relative to the local origin
    Position {
        north: f64,
        east: f64,
        down: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        yaw: Option<f64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TakeoffCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// Lands at a position, the current one when none is given, optionally
/// homing in on a marker on the way down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<TargetShape>,
}

fn default_delay() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayCommand {
    /// Seconds
    #[serde(default = "default_delay")]
    pub time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraCommand {
    /// Frames per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<f64>,
}

fn default_visit_delay() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,

    /// Seconds to hover over each object before the photo
    #[serde(default = "default_visit_delay")]
    pub delay: f64,
}

/// One node of a mission plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "commands", rename_all = "snake_case")]
pub enum Action {
    List(Vec<Action>),
    #[serde(rename = "mov_multiple")]
    MoveMultiple(Vec<Waypoint>),
    #[serde(rename = "mov")]
    MoveTo(Waypoint),
    #[serde(rename = "mov_local")]
    MoveLocal(LocalMove),
    Takeoff(TakeoffCommand),
    LandAt(LandCommand),
    Delay(DelayCommand),
    StartCamera(CameraCommand),
    StopCamera,
    Forever,
    #[serde(rename = "mov_to_objects_cap_pic")]
    VisitDetectedObjects(VisitCommand),
}

impl Action {
    pub fn tag(&self) -> &'static str {
        match self {
            Action::List(_) => "list",
            Action::MoveMultiple(_) => "mov_multiple",
            Action::MoveTo(_) => "mov",
            Action::MoveLocal(_) => "mov_local",
            Action::Takeoff(_) => "takeoff",
            Action::LandAt(_) => "land_at",
            Action::Delay(_) => "delay",
            Action::StartCamera(_) => "start_camera",
            Action::StopCamera => "stop_camera",
            Action::Forever => "forever",
            Action::VisitDetectedObjects(_) => "mov_to_objects_cap_pic",
        }
    }
}

/// Mission-wide overrides of configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionParameters {
    #[serde(default, alias = "height", skip_serializing_if = "Option::is_none")]
    pub flight_height: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_height: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub land_speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionPlan {
    pub action: Action,
    pub parameter: MissionParameters,
}

impl MissionPlan {
    pub fn to_value(&self) -> Result<Value, PlanError> {
        let mut value = serde_json::to_value(&self.action)?;
        if let Value::Object(map) = &mut value {
            map.insert("parameter".into(), serde_json::to_value(&self.parameter)?);
        }
        Ok(value)
    }

    pub fn from_value(value: Value, base: &Path) -> Result<Self, PlanError> {
        let mut map = match value {
            Value::Object(map) => map,
            other => return Err(PlanError::NotAnAction(other.to_string())),
        };

        let parameter = match map.remove("parameter") {
            Some(p) => serde_json::from_value(p)?,
            None => MissionParameters::default(),
        };
        let node = resolve_node(Value::Object(map), base, 0)?;

        Ok(MissionPlan {
            action: serde_json::from_value(node)?,
            parameter,
        })
    }
}

fn read_json(path: &Path) -> Result<Value, PlanError> {
    let data = fs::read(path).map_err(|source| PlanError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| PlanError::Json {
        path: path.to_owned(),
        source,
    })
}

/// Inlines `{"src": path}` references (relative to the referencing file) and
/// brings every node into the `{action, commands}` form. Keys other than
/// those two are dropped.
fn resolve_node(node: Value, base: &Path, depth: usize) -> Result<Value, PlanError> {
    if depth > MAX_PLAN_DEPTH {
        return Err(PlanError::TooDeep);
    }

    let mut map = match node {
        Value::Object(map) => map,
        other => return Err(PlanError::NotAnAction(other.to_string())),
    };

    if let Some(src) = map.get("src").and_then(Value::as_str) {
        let path = base.join(src);
        debug!("including plan {:?}", path);
        let included = read_json(&path)?;
        let dir = path.parent().map(Path::to_owned).unwrap_or_else(|| base.to_owned());
        return resolve_node(included, &dir, depth + 1);
    }

    let tag = match map.remove("action") {
        Some(Value::String(tag)) => tag,
        _ => return Err(PlanError::NotAnAction(Value::Object(map).to_string())),
    };

    let commands = match (tag.as_str(), map.remove("commands")) {
        ("stop_camera" | "forever", _) => None,
        ("list", Some(Value::Array(children))) => Some(Value::Array(
            children
                .into_iter()
                .map(|child| resolve_node(child, base, depth + 1))
                .collect::<Result<_, _>>()?,
        )),
        (_, Some(commands)) => Some(commands),
        (_, None) => Some(Value::Object(Map::new())),
    };

    let mut resolved = Map::new();
    resolved.insert("action".into(), Value::String(tag));
    if let Some(commands) = commands {
        resolved.insert("commands".into(), commands);
    }
    Ok(Value::Object(resolved))
}

/// Reads a plan file, inlining every referenced sub-plan.
pub fn load_plan(path: &Path) -> Result<MissionPlan, PlanError> {
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    MissionPlan::from_value(read_json(path)?, base)
}

/// Number of progress units in `plan`: composites count their children, a
/// multi-waypoint move counts each waypoint.
pub fn count(plan: &Action) -> u32 {
    match plan {
        Action::List(children) => children.iter().map(count).sum(),
        Action::MoveMultiple(targets) => targets.len() as u32,
        _ => 1,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// What is left to execute
    Plan(Action),

    /// The plan was fully consumed with this many completions to spare
    Remainder(u32),
}

/// Drops the first `completed` progress units from `plan`.
pub fn resume_subplan(plan: &Action, completed: u32) -> Resumed {
    match plan {
        Action::List(children) => {
            let mut remaining = completed;

            for (i, child) in children.iter().enumerate() {
                match resume_subplan(child, remaining) {
                    Resumed::Plan(rest) => {
                        let mut commands = Vec::with_capacity(children.len() - i);
                        commands.push(rest);
                        commands.extend(children[i + 1..].iter().cloned());
                        return Resumed::Plan(Action::List(commands));
                    }
                    Resumed::Remainder(r) => remaining = r,
                }
            }

            Resumed::Remainder(remaining)
        }
        Action::MoveMultiple(targets) => {
            let n = targets.len() as u32;
            if completed < n {
                Resumed::Plan(Action::MoveMultiple(targets[completed as usize..].to_vec()))
            } else {
                Resumed::Remainder(completed - n)
            }
        }
        leaf if completed == 0 => Resumed::Plan(leaf.clone()),
        _ => Resumed::Remainder(completed - 1),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn wp(lat: f64) -> Waypoint {
        Waypoint {
            lat,
            lon: 11.0,
            height: None,
            yaw: None,
        }
    }

    /// Each progress unit of a plan in execution order.
    fn units(plan: &Action) -> Vec<Action> {
        match plan {
            Action::List(children) => children.iter().flat_map(units).collect(),
            Action::MoveMultiple(targets) => targets.iter().cloned().map(Action::MoveTo).collect(),
            leaf => vec![leaf.clone()],
        }
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    fn random_plan(rng: &mut XorShift, depth: usize) -> Action {
        let choice = if depth >= 4 { 2 + rng.below(4) } else { rng.below(6) };
        match choice {
            0 | 1 => Action::List((0..rng.below(4)).map(|_| random_plan(rng, depth + 1)).collect()),
            2 => Action::MoveMultiple((0..rng.below(4)).map(|i| wp(i as f64)).collect()),
            3 => Action::Delay(DelayCommand {
                time: rng.below(10) as f64,
            }),
            4 => Action::Takeoff(TakeoffCommand::default()),
            _ => Action::MoveTo(wp(rng.below(90) as f64)),
        }
    }

    #[test]
    fn resume_preserves_remaining_work() {
        let mut rng = XorShift(0x2545_f491_4f6c_dd1d);

        for _ in 0..500 {
            let plan = random_plan(&mut rng, 0);
            let total = count(&plan);
            let all = units(&plan);
            assert_eq!(all.len() as u32, total);

            for completed in 0..=total {
                match resume_subplan(&plan, completed) {
                    Resumed::Plan(rest) => {
                        assert_eq!(count(&rest), total - completed, "{:?} at {}", plan, completed);
                        assert_eq!(units(&rest), all[completed as usize..].to_vec());
                    }
                    Resumed::Remainder(r) => {
                        assert_eq!(r, total - completed, "{:?} at {}", plan, completed);
                        assert_eq!(r, 0);
                    }
                }
            }

            assert_eq!(resume_subplan(&plan, total + 3), Resumed::Remainder(3));
        }
    }

    #[test]
    fn resume_at_zero_is_identity_for_nonempty_plans() {
        let plan = Action::List(vec![
            Action::Takeoff(TakeoffCommand::default()),
            Action::MoveMultiple(vec![wp(1.0), wp(2.0)]),
        ]);
        assert_eq!(resume_subplan(&plan, 0), Resumed::Plan(plan.clone()));
    }

    #[test]
    fn resume_mov_multiple_skips_finished_waypoints() {
        let plan: Action = serde_json::from_value(json!({
            "action": "mov_multiple",
            "commands": [
                {"lat": 1.0, "lon": 11.0},
                {"lat": 2.0, "lon": 11.0},
                {"lat": 3.0, "lon": 11.0}
            ]
        }))
        .unwrap();

        assert_eq!(count(&plan), 3);
        let rest = match resume_subplan(&plan, 1) {
            Resumed::Plan(rest) => rest,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            serde_json::to_value(&rest).unwrap(),
            json!({
                "action": "mov_multiple",
                "commands": [
                    {"lat": 2.0, "lon": 11.0},
                    {"lat": 3.0, "lon": 11.0}
                ]
            })
        );
    }

    #[test]
    fn resume_splits_nested_lists() {
        let plan = Action::List(vec![
            Action::Takeoff(TakeoffCommand::default()),
            Action::List(vec![Action::StopCamera, Action::Forever]),
            Action::StartCamera(CameraCommand::default()),
        ]);

        assert_eq!(
            resume_subplan(&plan, 2),
            Resumed::Plan(Action::List(vec![
                Action::List(vec![Action::Forever]),
                Action::StartCamera(CameraCommand::default()),
            ]))
        );
    }

    #[test]
    fn loads_every_action_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        fs::write(
            &path,
            json!({
                "parameter": {"height": 7.5, "land_speed": 1.0},
                "action": "list",
                "commands": [
                    {"action": "start_camera", "commands": {"ips": 2}},
                    {"action": "takeoff"},
                    {"action": "mov", "commands": {"lat": 48.0, "lon": 11.0, "yaw": 90}},
                    {
                        "action": "mov_local",
                        "commands": {"mode": "offset", "north": 1, "east": 0, "down": 0}
                    },
                    {"action": "delay", "commands": {}},
                    {"action": "stop_camera", "commands": {}},
                    {"action": "mov_to_objects_cap_pic"},
                    {
                        "action": "land_at",
                        "commands": {"lat": 48.0, "lon": 11.0, "color": "red", "shape": "code"}
                    },
                    {"action": "forever"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(plan.parameter.flight_height, Some(7.5));
        assert_eq!(count(&plan.action), 9);

        let children = match &plan.action {
            Action::List(children) => children,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(children[1], Action::Takeoff(TakeoffCommand { height: None }));
        assert_eq!(children[4], Action::Delay(DelayCommand { time: 1.0 }));
        assert_eq!(
            children[6],
            Action::VisitDetectedObjects(VisitCommand {
                height: None,
                delay: 0.5
            })
        );
        match &children[7] {
            Action::LandAt(land) => {
                assert_eq!(land.color, Some(ColorName::from("red")));
                assert_eq!(land.shape, Some(TargetShape::Code));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn includes_resolve_relative_to_their_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("parts")).unwrap();
        fs::write(
            dir.path().join("parts/leg.json"),
            json!({"action": "list", "commands": [{"src": "waypoints.json"}]}).to_string(),
        )
        .unwrap();
        fs::write(
            dir.path().join("parts/waypoints.json"),
            json!({
                "action": "mov_multiple",
                "commands": [{"lat": 1, "lon": 2}, {"lat": 3, "lon": 4}]
            })
            .to_string(),
        )
        .unwrap();

        let path = dir.path().join("main.json");
        fs::write(
            &path,
            json!({
                "action": "list",
                "commands": [{"action": "takeoff"}, {"src": "parts/leg.json"}]
            })
            .to_string(),
        )
        .unwrap();

        let plan = load_plan(&path).unwrap();
        assert_eq!(count(&plan.action), 3);

        // the resolved plan stands on its own
        let reloaded =
            MissionPlan::from_value(plan.to_value().unwrap(), Path::new("/nonexistent")).unwrap();
        assert_eq!(reloaded, plan);
    }

    #[test]
    fn unknown_tags_and_missing_includes_are_rejected() {
        let dir = TempDir::new().unwrap();

        let unknown = json!({"action": "list", "commands": [{"action": "barrel_roll"}]});
        assert!(matches!(
            MissionPlan::from_value(unknown, dir.path()),
            Err(PlanError::Invalid(_))
        ));

        let missing = json!({"action": "list", "commands": [{"src": "nope.json"}]});
        assert!(matches!(
            MissionPlan::from_value(missing, dir.path()),
            Err(PlanError::Io { .. })
        ));

        let incomplete = json!({"action": "mov", "commands": {"lon": 1}});
        assert!(MissionPlan::from_value(incomplete, dir.path()).is_err());
    }

    #[test]
    fn self_including_plan_is_cut_off() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loop.json");
        fs::write(&path, json!({"src": "loop.json"}).to_string()).unwrap();

        assert!(matches!(load_plan(&path), Err(PlanError::TooDeep)));
    }
}
