use std::str::FromStr;

use strum::{AsRefStr, Display, EnumString};

use crate::cloud::InstanceDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub instance_type: String,
    pub state: InstanceState,
    pub name: Option<String>,
}

impl InstanceRecord {
    /// `None` for terminated instances and for states the provider reports
    /// that we do not know about.
    pub fn from_description(desc: &InstanceDescription) -> Option<Self> {
        let state = match desc.state.as_deref().map(InstanceState::from_str) {
            Some(Ok(InstanceState::Terminated)) => return None,
            Some(Ok(state)) => state,
            _ => {
                tracing::warn!(
                    instance_id = %desc.instance_id,
                    state = ?desc.state,
                    "skipping instance with unrecognised state"
                );
                return None;
            }
        };
        Some(InstanceRecord {
            instance_id: desc.instance_id.clone(),
            public_ip: desc.public_ip.clone(),
            instance_type: desc.instance_type.clone().unwrap_or_default(),
            state,
            name: desc.tag("Name").map(str::to_string),
        })
    }
}

/// Point-in-time snapshot of the non-terminated instances in the account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    records: Vec<InstanceRecord>,
}

impl Inventory {
    pub fn from_descriptions<'a, I>(descriptions: I) -> Self
    where
        I: IntoIterator<Item = &'a InstanceDescription>,
    {
        Inventory {
            records: descriptions
                .into_iter()
                .filter_map(InstanceRecord::from_description)
                .collect(),
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.records.iter().find(|r| r.instance_id == instance_id)
    }

    /// Recorded Name tag of `instance_id`, if the instance is known and named.
    pub fn name_of(&self, instance_id: &str) -> Option<&str> {
        self.get(instance_id).and_then(|r| r.name.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Tag;

    fn desc(id: &str, state: &str, tags: Vec<Tag>) -> InstanceDescription {
        InstanceDescription {
            instance_id: id.to_string(),
            instance_type: Some("t3.micro".to_string()),
            public_ip: None,
            state: Some(state.to_string()),
            tags,
        }
    }

    #[test]
    fn terminated_instances_are_dropped() {
        let descs = vec![
            desc("i-1", "running", vec![]),
            desc("i-2", "terminated", vec![]),
            desc("i-3", "shutting-down", vec![]),
        ];
        let inv = Inventory::from_descriptions(&descs);
        let ids: Vec<_> = inv.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["i-1", "i-3"]);
        assert!(inv.iter().all(|r| r.state != InstanceState::Terminated));
        assert_eq!(inv.get("i-3").unwrap().state, InstanceState::ShuttingDown);
    }

    #[test]
    fn first_name_tag_wins() {
        let descs = vec![desc(
            "i-1",
            "running",
            vec![
                Tag::new("Team", "data"),
                Tag::new("Name", "first"),
                Tag::new("Name", "second"),
            ],
        )];
        let inv = Inventory::from_descriptions(&descs);
        assert_eq!(inv.name_of("i-1"), Some("first"));
    }

    #[test]
    fn untagged_instance_has_no_name() {
        let descs = vec![desc("i-1", "stopped", vec![])];
        let inv = Inventory::from_descriptions(&descs);
        assert_eq!(inv.name_of("i-1"), None);
        assert_eq!(inv.name_of("i-missing"), None);
    }

    #[test]
    fn unknown_state_is_skipped() {
        let descs = vec![desc("i-1", "hibernating", vec![])];
        assert!(Inventory::from_descriptions(&descs).is_empty());
    }

    #[test]
    fn state_round_trips_through_strings() {
        assert_eq!(InstanceState::ShuttingDown.as_ref(), "shutting-down");
        assert_eq!(InstanceState::from_str("pending").unwrap(), InstanceState::Pending);
    }
}
