//! Display sink: triple-buffered video layer plus an ARGB overlay

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, VppError};
use crate::frame::{BufferDescriptor, Frame, PixelFormat};
use crate::hal::{DisplayBackend, HwBuffer, Layer, MemAllocator};
use crate::pipeline::{Module, ModuleCore, ModuleKind};
use crate::utils::{lock, read, write};

/// Video buffers cycled round robin
pub const VIDEO_BUFFERS: usize = 3;
/// Glyph cell width in pixels at line width 1
pub const GLYPH_WIDTH: u32 = 8;
pub const DEFAULT_RECT_COLOR: u32 = 0xffff_0000;
pub const DEFAULT_RECT_LINE_WIDTH: u32 = 4;
pub const DEFAULT_TEXT_LINE_WIDTH: u32 = 1;

const ARGB_BYTES: usize = 4;

/// Brings the backend up and takes it down on drop
struct BackendUp(Arc<dyn DisplayBackend>);

impl Drop for BackendUp {
    fn drop(&mut self) {
        if let Err(e) = self.0.deinit() {
            warn!("display deinit: {e}");
        }
    }
}

struct VideoRing {
    bufs: Vec<HwBuffer>,
    next: usize,
}

struct DisplaySession {
    width: u32,
    height: u32,
    video: Mutex<VideoRing>,
    overlay: Mutex<HwBuffer>,
    // Last: buffers are freed before the backend goes down
    _backend: BackendUp,
}

pub struct Display {
    core: ModuleCore,
    backend: Arc<dyn DisplayBackend>,
    allocator: Arc<dyn MemAllocator>,
    session: RwLock<Option<DisplaySession>>,
}

impl Display {
    pub fn new(backend: Arc<dyn DisplayBackend>, allocator: Arc<dyn MemAllocator>) -> Self {
        Self {
            core: ModuleCore::new(ModuleKind::Display, 0, 0),
            backend,
            allocator,
            session: RwLock::new(None),
        }
    }

    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn open(&self, width: u32, height: u32) -> Result<()> {
        let mut session = write(&self.session);
        if session.is_some() {
            warn!("display already open");
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(VppError::InvalidArgument(format!(
                "display size {width}x{height}"
            )));
        }

        self.backend.init(width, height)?;
        let up = BackendUp(Arc::clone(&self.backend));

        let bufs = (0..VIDEO_BUFFERS)
            .map(|i| {
                HwBuffer::alloc(&self.allocator, width, height, PixelFormat::Nv12).map_err(|e| {
                    error!("alloc video buffer[{i}]: {e}");
                    e
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let overlay = HwBuffer::alloc(&self.allocator, width, height, PixelFormat::Argb8888)
            .map_err(|e| {
                error!("alloc overlay buffer: {e}");
                e
            })?;

        self.core.set_size(width, height);
        info!(width, height, "display open");
        *session = Some(DisplaySession {
            width,
            height,
            video: Mutex::new(VideoRing { bufs, next: 0 }),
            overlay: Mutex::new(overlay),
            _backend: up,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(module = %self.core.kind()))]
    pub fn close(&self) -> Result<()> {
        match write(&self.session).take() {
            Some(session) => {
                drop(session);
                info!("display closed");
                Ok(())
            }
            None => Err(VppError::NotOpen(ModuleKind::Display)),
        }
    }

    pub fn is_open(&self) -> bool {
        read(&self.session).is_some()
    }

    /// Draw a rectangle outline on the overlay and show it.
    ///
    /// Corners are clamped into the screen so that the whole line fits.
    /// With `flush` the overlay is cleared first.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_rect(
        &self,
        x0: i32,
        y0: i32,
        x1: i32,
        y1: i32,
        flush: bool,
        color: u32,
        line_width: u32,
    ) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Display))?;
        let (w, h) = (session.width, session.height);
        if line_width == 0 || line_width >= w || line_width >= h {
            return Err(VppError::InvalidArgument(format!(
                "line width {line_width} on a {w}x{h} display"
            )));
        }

        let x0 = clamp_coord(x0, w, line_width);
        let y0 = clamp_coord(y0, h, line_width);
        let x1 = clamp_coord(x1, w, line_width);
        let y1 = clamp_coord(y1, h, line_width);

        let mut overlay = lock(&session.overlay);
        if flush {
            clear(&mut overlay);
        }
        draw_outline(&mut overlay, (x0, y0), (x1, y1), color, line_width);
        self.backend.present(Layer::Overlay, &overlay)
    }

    /// Draw `text` on the overlay with its top-left corner at (x, y).
    ///
    /// Text running past the right edge is cut at the last glyph that fits.
    pub fn draw_text(
        &self,
        x: i32,
        y: i32,
        text: &str,
        flush: bool,
        color: u32,
        line_width: u32,
    ) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Display))?;
        let (w, h) = (session.width as i64, session.height as i64);
        let cell = line_width.max(1) as i64 * GLYPH_WIDTH as i64;
        let (xi, yi) = (x as i64, y as i64);
        if xi < 0 || xi > w || yi < 0 || yi > h || cell + yi > h {
            error!(x, y, line_width, "parameter error, string: {text}");
            return Err(VppError::InvalidArgument(format!(
                "text at ({x}, {y}) with line width {line_width} does not fit"
            )));
        }

        let glyphs = text.chars().count() as i64;
        let text: String = if glyphs * cell + xi > w {
            let keep = ((w - xi) / cell) as usize;
            debug!(keep, "truncating text to fit");
            text.chars().take(keep).collect()
        } else {
            text.to_string()
        };

        let mut overlay = lock(&session.overlay);
        if flush {
            clear(&mut overlay);
        }
        self.backend
            .render_text(&mut overlay, x as u32, y as u32, &text, color, line_width.max(1))?;
        self.backend.present(Layer::Overlay, &overlay)
    }

    /// Blank the overlay layer.
    pub fn clear_overlay(&self) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Display))?;
        let mut overlay = lock(&session.overlay);
        clear(&mut overlay);
        self.backend.present(Layer::Overlay, &overlay)
    }
}

fn clamp_coord(v: i32, dim: u32, line_width: u32) -> u32 {
    let max = (dim - line_width) as i64;
    (v as i64).clamp(0, max) as u32
}

fn clear(buf: &mut BufferDescriptor) {
    for plane in &mut buf.planes {
        plane.data.fill(0);
    }
}

fn draw_outline(buf: &mut BufferDescriptor, a: (u32, u32), b: (u32, u32), color: u32, lw: u32) {
    let (left, right) = (a.0.min(b.0), a.0.max(b.0));
    let (top, bottom) = (a.1.min(b.1), a.1.max(b.1));
    let width = buf.width;
    let height = buf.height;
    let Some(plane) = buf.planes.first_mut() else {
        return;
    };
    let px = color.to_le_bytes();
    let mut fill = |x0: u32, y0: u32, x1: u32, y1: u32| {
        for y in y0..y1.min(height) {
            for x in x0..x1.min(width) {
                let off = (y as usize * width as usize + x as usize) * ARGB_BYTES;
                if let Some(dst) = plane.data.get_mut(off..off + ARGB_BYTES) {
                    dst.copy_from_slice(&px);
                }
            }
        }
    };
    fill(left, top, right + lw, top + lw);
    fill(left, bottom, right + lw, bottom + lw);
    fill(left, top, left + lw, bottom + lw);
    fill(right, top, right + lw, bottom + lw);
}

impl Drop for Display {
    fn drop(&mut self) {
        self.core.shutdown_link();
    }
}

impl Module for Display {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn fetch_frame(&self, _channel: u32, _timeout_ms: u32) -> Result<Frame> {
        Err(VppError::Unsupported("display has no output"))
    }

    fn release_frame(&self, frame: Frame, _channel: u32) -> Result<()> {
        drop(frame.into_descriptor());
        Err(VppError::Unsupported("display has no output"))
    }

    /// Copy into the next video buffer and present it.
    fn push_frame(&self, frame: &Frame) -> Result<()> {
        let session = read(&self.session);
        let session = session.as_ref().ok_or(VppError::NotOpen(ModuleKind::Display))?;
        if (frame.width(), frame.height()) != (session.width, session.height) {
            return Err(VppError::InvalidArgument(format!(
                "frame {}x{} on a {}x{} display",
                frame.width(),
                frame.height(),
                session.width,
                session.height
            )));
        }
        let mut ring = lock(&session.video);
        let index = ring.next;
        ring.next = (index + 1) % ring.bufs.len();
        let buf = &mut ring.bufs[index];
        buf.copy_from(frame.descriptor())?;
        self.backend.present(Layer::Video, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::virtual_hw::{HeapAllocator, VirtualDisplay};

    fn display(w: u32, h: u32) -> (Display, Arc<VirtualDisplay>, Arc<HeapAllocator>) {
        let backend = VirtualDisplay::new();
        let alloc = HeapAllocator::new();
        let disp = Display::new(backend.clone(), alloc.clone());
        disp.open(w, h).unwrap();
        (disp, backend, alloc)
    }

    #[test]
    fn open_allocates_ring_and_overlay() {
        let (disp, backend, alloc) = display(64, 32);
        assert_eq!(alloc.live(), VIDEO_BUFFERS + 1);
        assert!(backend.is_up());
        disp.close().unwrap();
        assert_eq!(alloc.live(), 0);
        assert!(!backend.is_up());
    }

    #[test]
    fn failed_alloc_unwinds() {
        let backend = VirtualDisplay::new();
        let alloc = HeapAllocator::failing_after(2);
        let disp = Display::new(backend.clone(), alloc.clone());
        assert!(matches!(disp.open(64, 32), Err(VppError::Alloc(_))));
        assert_eq!(alloc.live(), 0);
        assert!(!backend.is_up());
        assert!(!disp.is_open());
    }

    #[test]
    fn frames_cycle_through_ring() {
        let (disp, backend, _alloc) = display(16, 8);
        for id in 0..5u64 {
            let mut frame = Frame::new(16, 8, PixelFormat::Nv12);
            if let Some(p) = frame.plane_mut(0) {
                p[..8].copy_from_slice(&id.to_le_bytes());
            }
            disp.set_frame(&frame).unwrap();
        }
        assert_eq!(backend.frame_markers(), vec![0, 1, 2, 3, 4]);
        assert!(matches!(
            disp.set_frame(&Frame::new(8, 8, PixelFormat::Nv12)),
            Err(VppError::InvalidArgument(_))
        ));
        assert!(matches!(disp.get_frame(0, 10), Err(VppError::Unsupported(_))));
    }

    #[test]
    fn rect_is_clamped() {
        assert_eq!(clamp_coord(-5, 100, 4), 0);
        assert_eq!(clamp_coord(99, 100, 4), 96);
        assert_eq!(clamp_coord(50, 100, 4), 50);

        let (disp, backend, _alloc) = display(32, 16);
        disp.draw_rect(-10, -10, 100, 100, true, DEFAULT_RECT_COLOR, 2)
            .unwrap();
        assert_eq!(backend.presented(Layer::Overlay), 1);
        assert!(disp.draw_rect(0, 0, 4, 4, false, 0, 0).is_err());

        disp.clear_overlay().unwrap();
        assert_eq!(backend.presented(Layer::Overlay), 2);
        disp.close().unwrap();
        assert!(matches!(disp.clear_overlay(), Err(VppError::NotOpen(_))));
    }

    #[test]
    fn outline_pixels() {
        let mut buf = BufferDescriptor::alloc(8, 8, PixelFormat::Argb8888);
        draw_outline(&mut buf, (1, 1), (5, 5), 0xff00ff00, 1);
        let at = |x: usize, y: usize| {
            let off = (y * 8 + x) * 4;
            u32::from_le_bytes(buf.planes[0].data[off..off + 4].try_into().unwrap())
        };
        assert_eq!(at(1, 1), 0xff00ff00);
        assert_eq!(at(5, 3), 0xff00ff00);
        assert_eq!(at(3, 3), 0);
        assert_eq!(at(0, 0), 0);
    }

    #[test]
    fn text_validation_and_truncation() {
        let (disp, backend, _alloc) = display(40, 16);
        assert!(disp.draw_text(-1, 0, "x", false, 0xffffffff, 1).is_err());
        assert!(disp.draw_text(0, 9, "x", false, 0xffffffff, 1).is_err());
        assert!(disp.draw_text(0, 0, "x", false, 0xffffffff, 2).is_ok());
        assert!(matches!(
            disp.draw_text(0, 0, "x", false, 0xffffffff, u32::MAX),
            Err(VppError::InvalidArgument(_))
        ));

        // 40 px wide, 8 px glyphs from x = 8: four fit
        disp.draw_text(8, 0, "abcdefgh", true, 0xffffffff, 1).unwrap();
        assert_eq!(backend.texts().last().map(String::as_str), Some("abcd"));
    }
}
