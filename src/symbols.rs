//! Slot maps: where each variable lives in a page's scratch buffer.
//!
//! Every compiled function of a page reads one flat `&[f64]` buffer. The buffer holds all
//! model variables (scalars take one slot, arrays one slot per element, in name order),
//! followed, for delay equations, by one packed state vector per declared delay.
//!
//! A [`Scope`] resolves identifiers against the map for a given array element, which is
//! how an element-wise equation `x[i]' = -k*x[i]` compiles to one expression per element.

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;

use crate::{
    bindings::{Bindings, Value},
    convert::SymbolResolver,
    errors::ConvertError,
    layout::StateLayout,
    normalizer::ELEMENT_SEPARATOR,
};

/// Location of one variable in the scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    /// Element count for arrays, `None` for scalars.
    pub len: Option<usize>,
}

impl Slot {
    /// Slot of a scalar (`element == None`) or of one element.
    pub fn component(&self, element: Option<usize>) -> Option<usize> {
        match (self.len, element) {
            (None, None) => Some(self.offset),
            (Some(len), Some(k)) if k < len => Some(self.offset + k),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct DelayedBlock {
    base: usize,
    count: usize,
    width: usize,
    /// State name -> (offset, stride, array length) in the packed vector.
    states: HashMap<String, (usize, usize, Option<usize>)>,
}

/// Scratch buffer layout of one compiled page instance.
#[derive(Debug, Clone)]
pub struct SlotMap {
    slots: BTreeMap<String, Slot>,
    len: usize,
    delayed: Option<DelayedBlock>,
}

impl SlotMap {
    /// Lays out every variable of `bindings` at its current size.
    pub fn new(bindings: &Bindings) -> Self {
        let mut slots = BTreeMap::new();
        let mut offset = 0;
        for (name, value) in bindings.iter() {
            let len = match value {
                Value::Scalar(_) => None,
                Value::Array(values) => Some(values.len()),
            };
            slots.insert(name.clone(), Slot { offset, len });
            offset += len.unwrap_or(1);
        }
        SlotMap {
            slots,
            len: offset,
            delayed: None,
        }
    }

    /// Appends room for `count` delayed copies of the packed state vector.
    pub fn with_delays(mut self, count: usize, layout: &StateLayout) -> Self {
        let states = layout
            .states()
            .iter()
            .filter_map(|name| {
                let (offset, stride) = layout.offset_of(name)?;
                Some((name.clone(), (offset, stride, layout.array_len(name))))
            })
            .collect();
        let width = layout.len();
        self.delayed = Some(DelayedBlock {
            base: self.len,
            count,
            width,
            states,
        });
        self.len += count * width;
        self
    }

    /// Total number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).copied()
    }

    /// Resolver for scalar context (`element == None`) or for one array element.
    pub fn scope(&self, element: Option<usize>) -> Scope<'_> {
        Scope { map: self, element }
    }

    /// Copies every binding into `scratch`.
    pub fn fill(&self, bindings: &Bindings, scratch: &mut [f64]) {
        for (name, slot) in &self.slots {
            match bindings.get(name) {
                Some(Value::Scalar(v)) => scratch[slot.offset] = *v,
                Some(Value::Array(values)) => {
                    let n = values.len().min(slot.len.unwrap_or(0));
                    scratch[slot.offset..slot.offset + n].copy_from_slice(&values[..n]);
                }
                None => {}
            }
        }
    }

    /// Writes the scratch value of `name` back into `bindings`.
    pub fn store(&self, name: &str, scratch: &[f64], bindings: &mut Bindings) {
        if let Some(slot) = self.slots.get(name) {
            match slot.len {
                None => {
                    bindings.set_scalar(name, scratch[slot.offset]);
                }
                Some(len) => {
                    for k in 0..len {
                        bindings.set_component(name, Some(k), scratch[slot.offset + k]);
                    }
                }
            }
        }
    }

    /// Copies delayed state vectors (delay-major) into the delayed block.
    pub fn write_delayed(&self, delayed: &[f64], scratch: &mut [f64]) {
        if let Some(block) = &self.delayed {
            let n = delayed.len().min(block.count * block.width);
            scratch[block.base..block.base + n].copy_from_slice(&delayed[..n]);
        }
    }

    /// Variable names in slot order, for diagnostics.
    pub fn describe(&self) -> String {
        self.slots
            .iter()
            .map(|(name, slot)| match slot.len {
                None => format!("{name}@{}", slot.offset),
                Some(len) => format!("{name}[{len}]@{}", slot.offset),
            })
            .join(", ")
    }

    fn literal_element(&self, name: &str) -> Option<Result<u32, ConvertError>> {
        let (base, index) = name.rsplit_once(ELEMENT_SEPARATOR)?;
        let index: usize = index.parse().ok()?;
        let slot = self.slots.get(base)?;
        let len = slot.len?;
        Some(if index < len {
            Ok((slot.offset + index) as u32)
        } else {
            Err(ConvertError::IndexOutOfRange {
                name: base.to_string(),
                index,
                len,
            })
        })
    }
}

/// Resolves identifiers for one evaluation context.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    map: &'a SlotMap,
    element: Option<usize>,
}

impl SymbolResolver for Scope<'_> {
    fn slot(&self, name: &str) -> Result<u32, ConvertError> {
        if let Some(slot) = self.map.slots.get(name) {
            return match (slot.len, self.element) {
                (None, _) => Ok(slot.offset as u32),
                (Some(len), Some(k)) if k < len => Ok((slot.offset + k) as u32),
                (Some(len), Some(k)) => Err(ConvertError::IndexOutOfRange {
                    name: name.to_string(),
                    index: k,
                    len,
                }),
                (Some(_), None) => Err(ConvertError::ArrayInScalarContext(name.to_string())),
            };
        }
        self.map
            .literal_element(name)
            .unwrap_or_else(|| Err(ConvertError::VariableNotFound(name.to_string())))
    }

    fn delayed_slot(&self, name: &str, delay: usize) -> Result<u32, ConvertError> {
        let block = self.map.delayed.as_ref().ok_or_else(|| {
            ConvertError::InvalidDelay(format!("delayed({name}, {delay}): page has no delays"))
        })?;
        if delay >= block.count {
            return Err(ConvertError::InvalidDelay(format!(
                "delayed({name}, {delay}): only {} delays declared",
                block.count
            )));
        }

        let (state, element) = match block.states.get(name) {
            Some(_) => (name, self.element),
            None => {
                let (base, index) = name.rsplit_once(ELEMENT_SEPARATOR).ok_or_else(|| {
                    ConvertError::InvalidDelay(format!("{name} is not a state of the page"))
                })?;
                let index = index
                    .parse()
                    .map_err(|_| ConvertError::InvalidDelay(format!("bad element in {name}")))?;
                (base, Some(index))
            }
        };
        let (offset, stride, len) = block.states.get(state).copied().ok_or_else(|| {
            ConvertError::InvalidDelay(format!("{state} is not a state of the page"))
        })?;

        let position = match (len, element) {
            (None, _) => offset,
            (Some(len), Some(k)) if k < len => offset + stride * k,
            (Some(len), Some(k)) => {
                return Err(ConvertError::IndexOutOfRange {
                    name: state.to_string(),
                    index: k,
                    len,
                })
            }
            (Some(_), None) => return Err(ConvertError::ArrayInScalarContext(state.to_string())),
        };
        Ok((block.base + delay * block.width + position) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.declare_scalar("k", 2.0);
        b.declare_array("x", vec![1.0, 2.0, 3.0]);
        b.declare_scalar("t", 0.0);
        b
    }

    #[test]
    fn test_slots_in_name_order() {
        let map = SlotMap::new(&bindings());
        assert_eq!(map.slot("k"), Some(Slot { offset: 0, len: None }));
        assert_eq!(map.slot("t"), Some(Slot { offset: 1, len: None }));
        assert_eq!(map.slot("x"), Some(Slot { offset: 2, len: Some(3) }));
        assert_eq!(map.len(), 5);
        assert_eq!(map.describe(), "k@0, t@1, x[3]@2");
    }

    #[test]
    fn test_scope_resolution() {
        let map = SlotMap::new(&bindings());
        assert_eq!(map.scope(Some(1)).slot("x"), Ok(3));
        assert_eq!(map.scope(Some(1)).slot("k"), Ok(0));
        assert_eq!(map.scope(None).slot("x__2"), Ok(4));
        assert_eq!(
            map.scope(None).slot("x"),
            Err(ConvertError::ArrayInScalarContext("x".to_string()))
        );
        assert!(matches!(
            map.scope(None).slot("x__3"),
            Err(ConvertError::IndexOutOfRange { index: 3, .. })
        ));
        assert!(matches!(
            map.scope(None).slot("q"),
            Err(ConvertError::VariableNotFound(_))
        ));
    }

    #[test]
    fn test_fill_and_store() {
        let mut b = bindings();
        let map = SlotMap::new(&b);
        let mut scratch = vec![0.0; map.len()];
        map.fill(&b, &mut scratch);
        assert_eq!(scratch, vec![2.0, 0.0, 1.0, 2.0, 3.0]);

        scratch[3] = 9.0;
        map.store("x", &scratch, &mut b);
        assert_eq!(b.array("x"), Some(&[1.0, 9.0, 3.0][..]));
    }
}
