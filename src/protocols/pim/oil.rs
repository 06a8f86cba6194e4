// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Channel OIL: the outgoing-interface list of one forwarding entry.
//!
//! Each outgoing interface carries a set of protocol flags. Requests from
//! different origins (PIM joins, local membership, (*,G) inheritance) OR
//! together; a removal clears only the flags it names and the interface
//! leaves the list when no flag remains.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::actions::PimAction;
use super::interface::VifIndex;
use super::sg::SourceGroup;
use super::stats;
use super::upstream::UpstreamId;
use super::PimCore;
use crate::log_debug;
use crate::logging::Facility;

bitflags! {
    /// Why an interface is in an OIL
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OifFlags: u8 {
        const PROTO_IGMP = 0x01;
        const PROTO_PIM = 0x02;
        const PROTO_STAR = 0x04;
        const PROTO_VXLAN = 0x08;
    }
}

/// Result of an OIL mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OilChange {
    /// The given flags were newly set
    Added(OifFlags),
    /// The given flags were cleared; `emptied` when the interface left the list
    Removed { flags: OifFlags, emptied: bool },
    /// Nothing changed
    Unchanged,
    /// Rejected: the interface is the incoming interface
    IsIif,
}

impl OilChange {
    pub fn changed(&self) -> bool {
        matches!(self, OilChange::Added(_) | OilChange::Removed { .. })
    }
}

/// Forwarding-plane handle for one (S,G) or (*,G)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelOil {
    pub sg: SourceGroup,
    /// Incoming (RPF) interface
    pub iif: Option<VifIndex>,
    oifs: BTreeMap<VifIndex, OifFlags>,
    /// Whether the entry has been pushed to the forwarding plane
    pub installed: bool,
}

impl ChannelOil {
    pub fn new(sg: SourceGroup, iif: Option<VifIndex>) -> Self {
        Self {
            sg,
            iif,
            oifs: BTreeMap::new(),
            installed: false,
        }
    }

    pub fn add(&mut self, vif: VifIndex, flags: OifFlags) -> OilChange {
        if self.iif == Some(vif) {
            return OilChange::IsIif;
        }
        let entry = self.oifs.entry(vif).or_default();
        let new_bits = flags - *entry;
        if new_bits.is_empty() {
            return OilChange::Unchanged;
        }
        *entry |= new_bits;
        OilChange::Added(new_bits)
    }

    pub fn del(&mut self, vif: VifIndex, flags: OifFlags) -> OilChange {
        let Some(entry) = self.oifs.get_mut(&vif) else {
            return OilChange::Unchanged;
        };
        let cleared = *entry & flags;
        if cleared.is_empty() {
            return OilChange::Unchanged;
        }
        entry.remove(cleared);
        let emptied = entry.is_empty();
        if emptied {
            self.oifs.remove(&vif);
        }
        OilChange::Removed {
            flags: cleared,
            emptied,
        }
    }

    /// Change the incoming interface; an OIF equal to the new iif is dropped
    pub fn set_iif(&mut self, iif: Option<VifIndex>) -> Option<OifFlags> {
        self.iif = iif;
        iif.and_then(|vif| self.oifs.remove(&vif))
    }

    pub fn flags(&self, vif: VifIndex) -> OifFlags {
        self.oifs.get(&vif).copied().unwrap_or_default()
    }

    pub fn contains(&self, vif: VifIndex) -> bool {
        self.oifs.contains_key(&vif)
    }

    pub fn is_empty(&self) -> bool {
        self.oifs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.oifs.len()
    }

    pub fn oifs(&self) -> impl Iterator<Item = (VifIndex, OifFlags)> + '_ {
        self.oifs.iter().map(|(vif, flags)| (*vif, *flags))
    }
}

impl PimCore {
    /// Add flags for `vif` to an entry's OIL, creating it once the iif is known
    pub(crate) fn oil_add(&mut self, id: UpstreamId, vif: VifIndex, flags: OifFlags) -> OilChange {
        let Some(up) = self.upstreams.get_mut(id) else {
            return OilChange::Unchanged;
        };
        let sg = up.sg;
        if up.channel_oil.is_none() {
            match up.rpf.interface {
                Some(iif) => up.channel_oil = Some(ChannelOil::new(sg, Some(iif))),
                None => {
                    log_debug!(
                        self.logger,
                        Facility::Oil,
                        &format!("{} no incoming interface, vif {} not added", sg, vif)
                    );
                    return OilChange::Unchanged;
                }
            }
        }
        let Some(oil) = up.channel_oil.as_mut() else {
            return OilChange::Unchanged;
        };
        let change = oil.add(vif, flags);
        match change {
            OilChange::Added(added) => {
                stats::oif_added();
                log_debug!(
                    self.logger,
                    Facility::Oil,
                    &format!("{} add vif {} {:?}", sg, vif, added)
                );
                self.emit(PimAction::AddOif {
                    sg,
                    vif,
                    flags: added,
                });
            }
            OilChange::IsIif => {
                log_debug!(
                    self.logger,
                    Facility::Oil,
                    &format!("{} vif {} is the incoming interface", sg, vif)
                );
            }
            _ => {}
        }
        change
    }

    /// Clear flags for `vif`; the interface leaves the OIL when none remain
    pub(crate) fn oil_del(&mut self, id: UpstreamId, vif: VifIndex, flags: OifFlags) -> OilChange {
        let Some(up) = self.upstreams.get_mut(id) else {
            return OilChange::Unchanged;
        };
        let sg = up.sg;
        let Some(oil) = up.channel_oil.as_mut() else {
            return OilChange::Unchanged;
        };
        let change = oil.del(vif, flags);
        if let OilChange::Removed { flags, emptied } = change {
            stats::oif_removed();
            log_debug!(
                self.logger,
                Facility::Oil,
                &format!("{} del vif {} {:?}{}", sg, vif, flags, if emptied { " (gone)" } else { "" })
            );
            self.emit(PimAction::DelOif {
                sg,
                vif,
                flags,
                removed: emptied,
            });
        }
        change
    }

    /// Drop the (*,G)-inherited flag; an (S,G) left with nothing to forward
    /// re-evaluates JoinDesired
    pub(crate) fn oil_del_inherited(&mut self, id: UpstreamId, vif: VifIndex) {
        let Some(up) = self.upstreams.get_mut(id) else {
            return;
        };
        let sg = up.sg;
        let change = up
            .channel_oil
            .as_mut()
            .map_or(OilChange::Unchanged, |oil| oil.del(vif, OifFlags::PROTO_STAR));
        if let OilChange::Removed { emptied, .. } = change {
            stats::oif_removed();
            self.emit(PimAction::DelInheritedOif {
                sg,
                vif,
                removed: emptied,
            });
        }
        if sg.is_sg() && self.empty_inherited_olist(id) {
            self.update_join_desired(id);
        }
    }

    /// Push the entry to the forwarding plane if it is not there yet
    pub(crate) fn mroute_install(&mut self, id: UpstreamId) -> bool {
        let Some(up) = self.upstreams.get_mut(id) else {
            return false;
        };
        let sg = up.sg;
        let Some(oil) = up.channel_oil.as_mut() else {
            return false;
        };
        let Some(iif) = oil.iif else {
            return false;
        };
        if oil.installed {
            return false;
        }
        oil.installed = true;
        self.emit(PimAction::MrouteInstall { sg, iif });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oil() -> ChannelOil {
        ChannelOil::new(
            SourceGroup::new("10.0.0.1".parse().unwrap(), "239.1.1.1".parse().unwrap()).unwrap(),
            Some(1),
        )
    }

    #[test]
    fn test_flags_or_combine() {
        let mut oil = oil();
        assert_eq!(oil.add(2, OifFlags::PROTO_PIM), OilChange::Added(OifFlags::PROTO_PIM));
        assert_eq!(
            oil.add(2, OifFlags::PROTO_PIM | OifFlags::PROTO_STAR),
            OilChange::Added(OifFlags::PROTO_STAR)
        );
        assert_eq!(oil.add(2, OifFlags::PROTO_STAR), OilChange::Unchanged);
        assert_eq!(oil.flags(2), OifFlags::PROTO_PIM | OifFlags::PROTO_STAR);
        assert_eq!(oil.len(), 1);
    }

    #[test]
    fn test_del_clears_only_mask() {
        let mut oil = oil();
        oil.add(2, OifFlags::PROTO_PIM | OifFlags::PROTO_IGMP);

        assert_eq!(
            oil.del(2, OifFlags::PROTO_PIM | OifFlags::PROTO_STAR),
            OilChange::Removed {
                flags: OifFlags::PROTO_PIM,
                emptied: false
            }
        );
        assert!(oil.contains(2));
        assert_eq!(
            oil.del(2, OifFlags::PROTO_IGMP),
            OilChange::Removed {
                flags: OifFlags::PROTO_IGMP,
                emptied: true
            }
        );
        assert!(oil.is_empty());
        assert_eq!(oil.del(2, OifFlags::PROTO_IGMP), OilChange::Unchanged);
    }

    #[test]
    fn test_iif_never_an_oif() {
        let mut oil = oil();
        assert_eq!(oil.add(1, OifFlags::PROTO_PIM), OilChange::IsIif);
        assert!(oil.is_empty());

        oil.add(3, OifFlags::PROTO_STAR);
        assert_eq!(oil.set_iif(Some(3)), Some(OifFlags::PROTO_STAR));
        assert!(!oil.contains(3));
    }
}
