use std::hash::Hash;
use ash::vk;

pub struct Queue {
    pub family: QueueFamily,
    pub handle: vk::Queue,
}

impl Queue {
    pub fn new(
        family: QueueFamily,
        handle: vk::Queue,
    ) -> Self {
        Self {
            family,
            handle,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_transfer(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
    }
}

impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}

impl Hash for QueueFamily {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// Queue the single-time commands of a resource operation are submitted to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Transfer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub graphics: QueueFamily,
    pub transfer: QueueFamily,
}

/// Picks the graphics family (which must also present) and a transfer family.
/// Transfer prefers a family without graphics support and falls back to the graphics family.
pub fn find_queue_families(
    props: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilySelection> {
    let graphics_index = props
        .iter()
        .enumerate()
        .position(|(i, q)| {
            q.queue_count > 0
                && q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && supports_present(i as u32)
        })?;

    let transfer_index = props
        .iter()
        .enumerate()
        .position(|(i, q)| {
            q.queue_count > 0
                && i != graphics_index
                && q.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .unwrap_or(graphics_index);

    let graphics = QueueFamily::new(graphics_index as u32, props[graphics_index], true);
    let transfer = QueueFamily::new(
        transfer_index as u32,
        props[transfer_index],
        transfer_index == graphics_index,
    );

    Some(QueueFamilySelection {
        graphics,
        transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_transfer_family_is_preferred() {
        let props = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selection = find_queue_families(&props, |_| true).unwrap();
        assert_eq!(selection.graphics.index, 0);
        assert_eq!(selection.transfer.index, 1);
        assert!(selection.graphics.supports_present());
    }

    #[test]
    fn transfer_falls_back_to_graphics() {
        let props = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let selection = find_queue_families(&props, |_| true).unwrap();
        assert_eq!(selection.transfer, selection.graphics);
    }

    #[test]
    fn graphics_family_must_present() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
        ];
        let selection = find_queue_families(&props, |i| i == 1).unwrap();
        assert_eq!(selection.graphics.index, 1);

        assert!(find_queue_families(&props, |_| false).is_none());
    }
}
