use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::NaiveTime;
use serde::Deserialize;

use crate::model::{CategoryId, IntegrationId, PropertyId, Reservation, RoomId};

/// Read-only reference data owned by the surrounding CRUD system: properties
/// with their timezone and check-in/check-out defaults, rooms, categories,
/// and the configured channel integrations.
///
/// Timezone and check-in/check-out are optional on purpose: operations that
/// need them fail closed instead of assuming a default.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertySpec {
    pub id: PropertyId,
    pub name: String,
    pub utc_offset_minutes: Option<i32>,
    pub check_in: Option<NaiveTime>,
    pub check_out: Option<NaiveTime>,
    #[serde(default)]
    pub rooms: Vec<RoomSpec>,
    #[serde(default)]
    pub categories: Vec<CategorySpec>,
}

impl PropertySpec {
    pub fn room(&self, id: RoomId) -> Option<&RoomSpec> {
        self.rooms.iter().find(|r| r.id == id)
    }

    pub fn category(&self, id: CategoryId) -> Option<&CategorySpec> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn rooms_in_category(&self, id: CategoryId) -> Vec<&RoomSpec> {
        self.rooms
            .iter()
            .filter(|r| r.category_id == Some(id))
            .collect()
    }

    /// Effective category of a reservation: its own, else the registry
    /// category of its assigned room.
    pub fn category_of(&self, r: &Reservation) -> Option<CategoryId> {
        r.category_id
            .or_else(|| r.room_id.and_then(|rid| self.room(rid)).and_then(|room| room.category_id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomSpec {
    pub id: RoomId,
    pub name: String,
    pub category_id: Option<CategoryId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategorySpec {
    pub id: CategoryId,
    pub name: String,
}

/// One configured calendar feed. The optional room/category scope becomes the
/// default hint for every event the feed produces.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationSpec {
    pub id: IntegrationId,
    pub property_id: PropertyId,
    pub url: String,
    pub channel: Option<String>,
    pub room_id: Option<RoomId>,
    pub category_id: Option<CategoryId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub integrations: Vec<IntegrationSpec>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = fs::read_to_string(path).map_err(RegistryError::Io)?;
        let registry: Registry = serde_json::from_str(&text).map_err(RegistryError::Parse)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn property(&self, id: PropertyId) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.id == id)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let mut property_ids = HashSet::new();
        for p in &self.properties {
            if !property_ids.insert(p.id) {
                return Err(RegistryError::Invalid(format!(
                    "duplicate property id {}",
                    p.id
                )));
            }
            let mut room_ids = HashSet::new();
            for r in &p.rooms {
                if !room_ids.insert(r.id) {
                    return Err(RegistryError::Invalid(format!(
                        "duplicate room id {} in property {}",
                        r.id, p.name
                    )));
                }
                if let Some(cid) = r.category_id
                    && p.category(cid).is_none()
                {
                    return Err(RegistryError::Invalid(format!(
                        "room {} references unknown category {cid}",
                        r.name
                    )));
                }
            }
        }
        for i in &self.integrations {
            let Some(p) = self.property(i.property_id) else {
                return Err(RegistryError::Invalid(format!(
                    "integration {} references unknown property {}",
                    i.id, i.property_id
                )));
            };
            if let Some(rid) = i.room_id
                && p.room(rid).is_none()
            {
                return Err(RegistryError::Invalid(format!(
                    "integration {} references unknown room {rid}",
                    i.id
                )));
            }
            if let Some(cid) = i.category_id
                && p.category(cid).is_none()
            {
                return Err(RegistryError::Invalid(format!(
                    "integration {} references unknown category {cid}",
                    i.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Io(e) => write!(f, "registry read failed: {e}"),
            RegistryError::Parse(e) => write!(f, "registry parse failed: {e}"),
            RegistryError::Invalid(msg) => write!(f, "registry invalid: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn rejects_room_with_unknown_category() {
        let registry = Registry {
            properties: vec![PropertySpec {
                id: Ulid::new(),
                name: "Seaside".into(),
                utc_offset_minutes: Some(60),
                check_in: None,
                check_out: None,
                rooms: vec![RoomSpec {
                    id: Ulid::new(),
                    name: "101".into(),
                    category_id: Some(Ulid::new()),
                }],
                categories: vec![],
            }],
            integrations: vec![],
        };
        assert!(matches!(
            registry.validate(),
            Err(RegistryError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_integration_for_unknown_property() {
        let registry = Registry {
            properties: vec![],
            integrations: vec![IntegrationSpec {
                id: Ulid::new(),
                property_id: Ulid::new(),
                url: "https://channel.example/cal.ics".into(),
                channel: None,
                room_id: None,
                category_id: None,
            }],
        };
        assert!(matches!(
            registry.validate(),
            Err(RegistryError::Invalid(_))
        ));
    }

    #[test]
    fn parses_registry_json() {
        let pid = Ulid::new();
        let rid = Ulid::new();
        let cid = Ulid::new();
        let text = format!(
            r#"{{
              "properties": [{{
                "id": "{pid}",
                "name": "Seaside",
                "utc_offset_minutes": 120,
                "check_in": "15:00:00",
                "check_out": "11:00:00",
                "categories": [{{"id": "{cid}", "name": "Deluxe"}}],
                "rooms": [{{"id": "{rid}", "name": "101", "category_id": "{cid}"}}]
              }}],
              "integrations": []
            }}"#
        );
        let registry: Registry = serde_json::from_str(&text).unwrap();
        registry.validate().unwrap();
        let p = registry.property(pid).unwrap();
        assert_eq!(p.rooms_in_category(cid).len(), 1);
        assert_eq!(p.check_in.unwrap(), "15:00:00".parse::<NaiveTime>().unwrap());
    }
}
