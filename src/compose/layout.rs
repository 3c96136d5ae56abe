//! Page selection and header geometry. Pure arithmetic, no PDF objects.

/// A4 portrait in PDF points.
pub const A4_WIDTH: f32 = 595.2756;
pub const A4_HEIGHT: f32 = 841.8898;

/// Height of the header band drawn over branded pages.
pub const HEADER_BAND_HEIGHT: f32 = 100.0;
/// Horizontal inset of each logo from its page edge.
pub const LOGO_PADDING: f32 = 20.0;
/// Logo heights as a fraction of the band height.
pub const LEFT_LOGO_SCALE: f32 = 0.5;
pub const RIGHT_LOGO_SCALE: f32 = 0.8;

/// Contiguous span `[start, end)` of source page indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    /// Pages kept from a document of `total` pages.
    ///
    /// The first page is dropped only when asked to and only when something
    /// would remain, so a one-page report keeps its page.
    pub fn window(total: usize, remove_first_page: bool) -> Self {
        let start = if remove_first_page && total > 1 { 1 } else { 0 };
        Self { start, end: total }
    }

    /// Content pages contributed to a merged report: the window minus the
    /// terminal page. When that leaves nothing, the whole window is used.
    pub fn content_window(total: usize, remove_first_page: bool) -> Self {
        let window = Self::window(total, remove_first_page);
        let without_terminal = Self {
            start: window.start,
            end: total.saturating_sub(1),
        };
        if without_terminal.is_empty() {
            window
        } else {
            without_terminal
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end.max(self.start)
    }
}

/// Which page edge a logo is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Left,
    Right,
}

/// Size of a logo scaled to a target height, keeping its aspect ratio.
pub fn scaled_to_height(pixel_width: u32, pixel_height: u32, target_height: f32) -> (f32, f32) {
    if pixel_width == 0 || pixel_height == 0 {
        return (0.0, 0.0);
    }
    let aspect = pixel_height as f32 / pixel_width as f32;
    (target_height / aspect, target_height)
}

/// Lower-left corner of a logo of size `(w, h)` inside the header band of a
/// page whose MediaBox is `[x0, y0, x1, y1]`.
pub fn logo_origin(media_box: [f32; 4], anchor: Anchor, w: f32, h: f32) -> (f32, f32) {
    let [x0, _, x1, y1] = media_box;
    let x = match anchor {
        Anchor::Left => x0 + LOGO_PADDING,
        Anchor::Right => x1 - w - LOGO_PADDING,
    };
    let y = y1 - HEADER_BAND_HEIGHT / 2.0 - h / 2.0;
    (x, y)
}

/// The header band rectangle `(x, y, w, h)` for a MediaBox.
pub fn band_rect(media_box: [f32; 4]) -> (f32, f32, f32, f32) {
    let [x0, _, x1, y1] = media_box;
    (x0, y1 - HEADER_BAND_HEIGHT, x1 - x0, HEADER_BAND_HEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_first_page_only_when_others_remain() {
        assert_eq!(PageRange::window(3, true), PageRange { start: 1, end: 3 });
        assert_eq!(PageRange::window(1, true), PageRange { start: 0, end: 1 });
        assert_eq!(PageRange::window(3, false), PageRange { start: 0, end: 3 });
        assert!(PageRange::window(0, true).is_empty());
    }

    #[test]
    fn content_window_excludes_terminal_page() {
        let w = PageRange::content_window(4, true);
        assert_eq!(w, PageRange { start: 1, end: 3 });
        assert!(!w.contains(3));
    }

    #[test]
    fn content_window_falls_back_when_nothing_is_left() {
        // two pages, first removed: only the terminal page remains
        assert_eq!(
            PageRange::content_window(2, true),
            PageRange { start: 1, end: 2 }
        );
        assert_eq!(
            PageRange::content_window(1, true),
            PageRange { start: 0, end: 1 }
        );
    }

    #[test]
    fn logos_are_padded_and_centred_in_band() {
        let media = [0.0, 0.0, A4_WIDTH, A4_HEIGHT];
        let (w, h) = scaled_to_height(200, 100, HEADER_BAND_HEIGHT * LEFT_LOGO_SCALE);
        assert_eq!((w, h), (100.0, 50.0));

        let (x, y) = logo_origin(media, Anchor::Left, w, h);
        assert_eq!(x, LOGO_PADDING);
        assert!((y - (A4_HEIGHT - 75.0)).abs() < 1e-3);

        let (x, _) = logo_origin(media, Anchor::Right, w, h);
        assert!((x - (A4_WIDTH - 100.0 - LOGO_PADDING)).abs() < 1e-3);
    }
}
