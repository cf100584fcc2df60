use std::collections::BTreeMap;
use std::sync::RwLock;

/// One item bound to a device element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBinding {
    element_id: String,
    last_state: Option<String>,
}

impl ItemBinding {
    /// Parse a binding configuration string; it names the device element id
    pub fn from_config(binding_config: &str) -> Result<Self, BindingError> {
        let element_id = binding_config.trim();
        if element_id.is_empty() {
            return Err(BindingError::MissingElementId);
        }
        Ok(Self {
            element_id: element_id.to_string(),
            last_state: None,
        })
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn last_state(&self) -> Option<&str> {
        self.last_state.as_deref()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("binding configuration must name a device element id")]
    MissingElementId,

    #[error("binding registry lock poisoned")]
    Poisoned,
}

/// Items that appeared or disappeared when bindings were reloaded
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BindingChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Item name -> element id mapping with the last state seen per item
///
/// Supplied by whoever parses the item configuration; the poll loop only
/// reads it and records last states.
pub trait BindingRegistry: Send + Sync {
    fn item_names(&self) -> Vec<String>;

    /// Element id bound to `item_name`, if the item is bound here
    fn element_id(&self, item_name: &str) -> Option<String>;

    /// Last state recorded for `item_name`; `None` before the first poll
    fn last_state(&self, item_name: &str) -> Option<String>;

    fn set_last_state(&self, item_name: &str, state: &str);
}

/// In-memory binding registry
#[derive(Debug, Default)]
pub struct ItemBindings {
    bindings: RwLock<BTreeMap<String, ItemBinding>>,
}

impl ItemBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `item name -> binding configuration` pairs
    pub fn from_config<'a>(
        items: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<Self, BindingError> {
        let registry = Self::new();
        for (item_name, binding_config) in items {
            registry.bind(item_name, binding_config)?;
        }
        Ok(registry)
    }

    /// Bind an item, replacing any previous binding (and its last state)
    pub fn bind(&self, item_name: &str, binding_config: &str) -> Result<(), BindingError> {
        let binding = ItemBinding::from_config(binding_config)?;
        self.bindings
            .write()
            .map_err(|_| BindingError::Poisoned)?
            .insert(item_name.to_string(), binding);
        Ok(())
    }

    /// Replace every binding with `items`
    ///
    /// Nothing changes unless every entry parses. Items whose element id is
    /// unchanged keep their last state.
    pub fn reload<'a>(
        &self,
        items: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<BindingChanges, BindingError> {
        let mut next = BTreeMap::new();
        for (item_name, binding_config) in items {
            next.insert(item_name.clone(), ItemBinding::from_config(binding_config)?);
        }

        let mut bindings = self.bindings.write().map_err(|_| BindingError::Poisoned)?;
        let mut changes = BindingChanges::default();
        for item_name in bindings.keys() {
            if !next.contains_key(item_name) {
                changes.removed.push(item_name.clone());
            }
        }
        for (item_name, binding) in next.iter_mut() {
            match bindings.get(item_name) {
                Some(old) if old.element_id == binding.element_id => {
                    binding.last_state = old.last_state.clone();
                }
                Some(_) => {}
                None => changes.added.push(item_name.clone()),
            }
        }
        *bindings = next;
        Ok(changes)
    }

    /// Remove an item's binding, returning it if there was one
    pub fn unbind(&self, item_name: &str) -> Option<ItemBinding> {
        self.bindings
            .write()
            .ok()
            .and_then(|mut bindings| bindings.remove(item_name))
    }

    pub fn get(&self, item_name: &str) -> Option<ItemBinding> {
        self.bindings
            .read()
            .ok()
            .and_then(|bindings| bindings.get(item_name).cloned())
    }

    pub fn len(&self) -> usize {
        self.bindings.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BindingRegistry for ItemBindings {
    fn item_names(&self) -> Vec<String> {
        self.bindings
            .read()
            .map(|bindings| bindings.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn element_id(&self, item_name: &str) -> Option<String> {
        self.get(item_name).map(|b| b.element_id)
    }

    fn last_state(&self, item_name: &str) -> Option<String> {
        self.get(item_name).and_then(|b| b.last_state)
    }

    fn set_last_state(&self, item_name: &str, state: &str) {
        if let Ok(mut bindings) = self.bindings.write() {
            if let Some(binding) = bindings.get_mut(item_name) {
                binding.last_state = Some(state.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_lookup() {
        let registry = ItemBindings::new();
        registry.bind("Kitchen_Light", " 5 ").unwrap();
        registry.bind("Blind", "12").unwrap();

        assert_eq!(registry.item_names(), vec!["Blind", "Kitchen_Light"]);
        assert_eq!(registry.element_id("Kitchen_Light").as_deref(), Some("5"));
        assert_eq!(registry.element_id("Unknown"), None);
        assert_eq!(registry.last_state("Kitchen_Light"), None);
    }

    #[test]
    fn test_blank_binding_rejected() {
        let registry = ItemBindings::new();
        assert_eq!(
            registry.bind("Broken", "   "),
            Err(BindingError::MissingElementId)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_last_state() {
        let registry = ItemBindings::new();
        registry.bind("Blind", "12").unwrap();

        registry.set_last_state("Blind", "DOWN");
        assert_eq!(registry.last_state("Blind").as_deref(), Some("DOWN"));

        // Unbound items are ignored
        registry.set_last_state("Ghost", "ON");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rebind_clears_last_state() {
        let registry = ItemBindings::new();
        registry.bind("Blind", "12").unwrap();
        registry.set_last_state("Blind", "UP");

        registry.bind("Blind", "13").unwrap();
        let binding = registry.get("Blind").unwrap();
        assert_eq!(binding.element_id(), "13");
        assert_eq!(binding.last_state(), None);
    }

    #[test]
    fn test_unbind() {
        let registry = ItemBindings::new();
        registry.bind("Blind", "12").unwrap();

        assert_eq!(registry.unbind("Blind").unwrap().element_id(), "12");
        assert!(registry.unbind("Blind").is_none());
        assert!(registry.item_names().is_empty());
    }

    #[test]
    fn test_reload_reports_changes() {
        let registry = ItemBindings::new();
        registry.bind("Light", "4").unwrap();
        registry.bind("Blind", "12").unwrap();
        registry.bind("Fan", "20").unwrap();
        registry.set_last_state("Blind", "UP");
        registry.set_last_state("Light", "ON");

        let items = BTreeMap::from([
            ("Light".to_string(), "9".to_string()),
            ("Blind".to_string(), "12".to_string()),
            ("Heater".to_string(), "30".to_string()),
        ]);
        let changes = registry.reload(&items).unwrap();

        assert_eq!(
            changes,
            BindingChanges {
                added: vec!["Heater".to_string()],
                removed: vec!["Fan".to_string()],
            }
        );
        assert_eq!(registry.element_id("Light").as_deref(), Some("9"));
        assert_eq!(registry.last_state("Light"), None);
        assert_eq!(registry.last_state("Blind").as_deref(), Some("UP"));
        assert_eq!(registry.element_id("Fan"), None);
    }

    #[test]
    fn test_reload_rejects_blank_binding_without_changes() {
        let registry = ItemBindings::new();
        registry.bind("Light", "4").unwrap();

        let items = BTreeMap::from([
            ("Light".to_string(), "9".to_string()),
            ("Broken".to_string(), " ".to_string()),
        ]);
        assert_eq!(registry.reload(&items), Err(BindingError::MissingElementId));
        assert_eq!(registry.element_id("Light").as_deref(), Some("4"));
    }

    #[test]
    fn test_bind_on_poisoned_registry_fails() {
        let registry = std::sync::Arc::new(ItemBindings::new());
        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.bindings.write().unwrap();
            panic!("poison the registry lock");
        })
        .join();

        assert_eq!(registry.bind("Light", "4"), Err(BindingError::Poisoned));
    }

    #[test]
    fn test_from_config() {
        let items = BTreeMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ]);

        let registry = ItemBindings::from_config(&items).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.element_id("B").as_deref(), Some("2"));
    }
}
