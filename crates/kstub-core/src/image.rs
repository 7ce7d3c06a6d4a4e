//! Loaded executable image description.

/// Where the debugged image was linked and where it actually lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub name: String,
    pub load_address: u64,
    pub link_address: u64,
}

impl ImageDescriptor {
    pub fn new(name: impl Into<String>, load_address: u64, link_address: u64) -> Self {
        Self {
            name: name.into(),
            load_address,
            link_address,
        }
    }

    /// Offset added to link-time addresses (two's complement if negative).
    pub const fn slide(&self) -> u64 {
        self.load_address.wrapping_sub(self.link_address)
    }

    /// `qOffsets` reply body.
    pub fn offsets(&self) -> String {
        let slide = self.slide();
        format!("Text={slide:x};Data={slide:x};Bss={slide:x}")
    }

    /// `qXfer:libraries:read` document listing this image.
    pub fn library_list_xml(&self) -> String {
        format!(
            "<library-list><library name=\"{}\"><segment address=\"{:#x}\"/></library></library-list>",
            escape_xml(&self.name),
            self.load_address
        )
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slide() {
        let image = ImageDescriptor::new("kernel", 0xffff_fff0_0800_4000, 0xffff_fff0_0700_4000);
        assert_eq!(image.slide(), 0x0100_0000);
        assert_eq!(image.offsets(), "Text=1000000;Data=1000000;Bss=1000000");
    }

    #[test]
    fn test_negative_slide_wraps() {
        let image = ImageDescriptor::new("k", 0x1000, 0x2000);
        assert_eq!(image.slide(), u64::MAX - 0xfff);
    }

    #[test]
    fn test_library_list() {
        let image = ImageDescriptor::new("a<b", 0x4000, 0x4000);
        assert_eq!(
            image.library_list_xml(),
            "<library-list><library name=\"a&lt;b\"><segment address=\"0x4000\"/></library></library-list>"
        );
    }
}
