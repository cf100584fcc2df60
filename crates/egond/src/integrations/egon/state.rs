//! Translation of the controller's XML state snapshot into item values.
//!
//! The snapshot looks like:
//!
//! ```xml
//! <?xml version="1.0"?>
//! <egon_data>
//!   <element_states>
//!     <element_state id="3" value="up"/>
//!     <element_state id="7" value="21.5"/>
//!   </element_states>
//! </egon_data>
//! ```

use std::collections::HashMap;

use quick_xml::events::BytesStart;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

use super::client::DeviceError;
use crate::engine::Decimal;
use crate::engine::ItemValue;

/// Value reported for an element id missing from the snapshot
pub const UNKNOWN_VALUE: &str = "???";

const ROOT: &[u8] = b"egon_data";
const STATES: &[u8] = b"element_states";
const STATE: &[u8] = b"element_state";

/// Element id -> value map for one poll cycle
#[derive(Debug, Default)]
pub struct StateSnapshot {
    values: HashMap<String, String>,
}

impl StateSnapshot {
    /// Parse a snapshot body. Only `element_state` nodes directly under
    /// `/egon_data/element_states` count; for a repeated id the first one wins.
    pub fn parse(xml: &str) -> Result<Self, DeviceError> {
        let mut reader = Reader::from_str(xml);
        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut values = HashMap::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if is_state_node(&path, &e) {
                        record(&e, &mut values)?;
                    }
                    path.push(e.name().as_ref().to_vec());
                }
                Event::Empty(e) => {
                    if is_state_node(&path, &e) {
                        record(&e, &mut values)?;
                    }
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { values })
    }

    /// Uppercased value for `element_id`, or [`UNKNOWN_VALUE`]
    pub fn value(&self, element_id: &str) -> String {
        self.values
            .get(element_id)
            .map(|v| v.to_uppercase())
            .unwrap_or_else(|| UNKNOWN_VALUE.to_string())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn is_state_node(path: &[Vec<u8>], e: &BytesStart) -> bool {
    e.name().as_ref() == STATE && path.len() == 2 && path[0] == ROOT && path[1] == STATES
}

fn record(e: &BytesStart, values: &mut HashMap<String, String>) -> Result<(), DeviceError> {
    let mut id = None;
    let mut value = None;
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        match attr.key.as_ref() {
            b"id" => id = Some(attr.unescape_value()?.into_owned()),
            b"value" => value = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }

    if let Some(id) = id {
        values.entry(id).or_insert_with(|| value.unwrap_or_default());
    }
    Ok(())
}

/// Extract the uppercased value of one element from a snapshot body
pub fn extract_value(xml: &str, element_id: &str) -> Result<String, DeviceError> {
    Ok(StateSnapshot::parse(xml)?.value(element_id))
}

/// Coerce an extracted value into the type published on the bus
///
/// `UP*` and `DOWN*` are shutter positions, anything with a decimal point is
/// a number, the rest is passed through as a string.
pub fn to_item_value(state: &str) -> ItemValue {
    if state.starts_with("UP") {
        ItemValue::Percent(0)
    } else if state.starts_with("DOWN") {
        ItemValue::Percent(100)
    } else if state.contains('.') {
        match state.parse::<Decimal>() {
            Ok(d) => ItemValue::Decimal(d),
            Err(e) => {
                warn!("Ego-n value {:?} is not a decimal ({}), publishing as string", state, e);
                ItemValue::String(state.to_string())
            }
        }
    } else {
        ItemValue::String(state.to_string())
    }
}
