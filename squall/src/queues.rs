// Queue role assignment
//
// Decides which queue family serves each role on a device. This is
// done once when the device is opened and never changes afterwards.
//
// Austin Shafer - 2024
use ash::vk;

use crate::error::{Result, SquallError};
use crate::selector::Requirements;

/// The jobs we hand out to queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [
        QueueRole::Graphics,
        QueueRole::Compute,
        QueueRole::Transfer,
        QueueRole::Present,
    ];

    fn index(self) -> usize {
        match self {
            QueueRole::Graphics => 0,
            QueueRole::Compute => 1,
            QueueRole::Transfer => 2,
            QueueRole::Present => 3,
        }
    }
}

/// The family chosen for one role
///
/// The `shares_*` flags are set whenever another role resolved to the
/// same family index. Callers use them to skip queue family ownership
/// transfers between roles that live on the same queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub family_index: Option<u32>,
    pub shares_with_graphics: bool,
    pub shares_with_compute: bool,
    pub shares_with_transfer: bool,
    pub shares_with_present: bool,
}

impl QueueInfo {
    pub fn shares_with(&self, role: QueueRole) -> bool {
        match role {
            QueueRole::Graphics => self.shares_with_graphics,
            QueueRole::Compute => self.shares_with_compute,
            QueueRole::Transfer => self.shares_with_transfer,
            QueueRole::Present => self.shares_with_present,
        }
    }

    fn set_shares_with(&mut self, role: QueueRole) {
        match role {
            QueueRole::Graphics => self.shares_with_graphics = true,
            QueueRole::Compute => self.shares_with_compute = true,
            QueueRole::Transfer => self.shares_with_transfer = true,
            QueueRole::Present => self.shares_with_present = true,
        }
    }
}

/// Queue families per role for one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    qa_roles: [QueueInfo; 4],
}

/// First family index matching `pred`
fn first_family<F>(families: &[vk::QueueFlags], pred: F) -> Option<u32>
where
    F: Fn(usize, vk::QueueFlags) -> bool,
{
    families
        .iter()
        .enumerate()
        .find(|(i, flags)| pred(*i, **flags))
        .map(|(i, _)| i as u32)
}

impl QueueAssignment {
    /// Resolve queue families for every role
    ///
    /// `families` is the flag list reported by the driver, in order.
    /// `present_support[i]` says if family `i` can present to the target,
    /// pass an empty slice when nothing is being presented.
    ///
    /// Graphics prefers a family without compute when compute is also
    /// requested, to keep the two on separate hardware queues. Compute
    /// takes the first compute family that isn't the graphics family and
    /// falls back to the graphics family. Transfer takes the first family
    /// distinct from both of those, and falls back to any transfer capable
    /// family. Present uses the graphics family if it can, otherwise the
    /// first family that can present.
    pub fn resolve(
        families: &[vk::QueueFlags],
        present_support: &[bool],
        reqs: Requirements,
    ) -> Result<Self> {
        let any_work =
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let want_compute = reqs.contains(Requirements::COMPUTE);

        let graphics = match want_compute {
            true => first_family(families, |_, f| {
                f.contains(vk::QueueFlags::GRAPHICS) && !f.contains(vk::QueueFlags::COMPUTE)
            })
            .or_else(|| first_family(families, |_, f| f.contains(vk::QueueFlags::GRAPHICS))),
            false => first_family(families, |_, f| f.contains(vk::QueueFlags::GRAPHICS)),
        };

        let compute = first_family(families, |i, f| {
            f.contains(vk::QueueFlags::COMPUTE) && Some(i as u32) != graphics
        })
        .or_else(|| match graphics {
            Some(g) if families[g as usize].contains(vk::QueueFlags::COMPUTE) => Some(g),
            _ => None,
        });

        let transfer = first_family(families, |i, f| {
            let i = Some(i as u32);
            f.intersects(any_work) && i != graphics && i != compute
        })
        .or_else(|| first_family(families, |_, f| f.contains(vk::QueueFlags::TRANSFER)))
        // graphics and compute queues implicitly support transfer
        .or(graphics)
        .or(compute);

        let present = match present_support.is_empty() {
            true => None,
            false => {
                let supports = |i: u32| present_support.get(i as usize).copied().unwrap_or(false);
                match graphics {
                    Some(g) if supports(g) => Some(g),
                    _ => (0..present_support.len() as u32).find(|i| supports(*i)),
                }
            }
        };

        if reqs.contains(Requirements::GRAPHICS) && graphics.is_none() {
            return Err(SquallError::NO_QUEUE_FAMILY(QueueRole::Graphics));
        }
        if want_compute && compute.is_none() {
            return Err(SquallError::NO_QUEUE_FAMILY(QueueRole::Compute));
        }
        if reqs.contains(Requirements::TRANSFER) && transfer.is_none() {
            return Err(SquallError::NO_QUEUE_FAMILY(QueueRole::Transfer));
        }
        if !present_support.is_empty() && present.is_none() {
            return Err(SquallError::NO_QUEUE_FAMILY(QueueRole::Present));
        }

        let mut ret = Self::default();
        ret.qa_roles[QueueRole::Graphics.index()].family_index = graphics;
        ret.qa_roles[QueueRole::Compute.index()].family_index = compute;
        ret.qa_roles[QueueRole::Transfer.index()].family_index = transfer;
        ret.qa_roles[QueueRole::Present.index()].family_index = present;

        // Mark every pair that landed on the same family
        for a in QueueRole::ALL.iter() {
            for b in QueueRole::ALL.iter() {
                if a == b {
                    continue;
                }
                let fa = ret.qa_roles[a.index()].family_index;
                if fa.is_some() && fa == ret.qa_roles[b.index()].family_index {
                    ret.qa_roles[a.index()].set_shares_with(*b);
                }
            }
        }

        Ok(ret)
    }

    pub fn get(&self, role: QueueRole) -> &QueueInfo {
        &self.qa_roles[role.index()]
    }

    pub fn family(&self, role: QueueRole) -> Option<u32> {
        self.get(role).family_index
    }

    /// The distinct family indices in use, one queue is created per entry
    pub fn unique_families(&self) -> Vec<u32> {
        let mut ret: Vec<u32> = Vec::new();
        for role in QueueRole::ALL.iter() {
            if let Some(family) = self.family(*role) {
                if !ret.contains(&family) {
                    ret.push(family);
                }
            }
        }
        ret
    }
}
