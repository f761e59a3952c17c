//! Rendering capability: turns one event payload into pixels.
//!
//! [`FlatRenderer`] is a small coverage-based software renderer. Every
//! primitive is painted in a single pass over its bounding box, so a
//! translucent stroke never blends with itself at polyline joints.
//! Output depends only on the payload and the raster it is painted onto.

use slate_collab::event::{
    EventPayload, Point, ShapeKind, ShapePayload, StrokePayload, StrokeTool, TextPayload,
};

use crate::raster::{Color, Raster};

/// Something that can paint drawing events onto a raster.
pub trait Renderer {
    fn render(&self, payload: &EventPayload, raster: &mut Raster);
}

/// Flat-shaded software renderer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatRenderer;

impl FlatRenderer {
    pub fn new() -> Self {
        Self
    }

    fn stroke(&self, stroke: &StrokePayload, raster: &mut Raster) {
        let color = match stroke.tool {
            StrokeTool::Eraser => raster.background(),
            StrokeTool::Pen => match parse_color(&stroke.color) {
                Some(color) => color,
                None => return,
            },
        };
        let radius = half_width(stroke.width);
        let points = &stroke.points;
        match points.len() {
            0 => {}
            1 => {
                let c = points[0];
                paint(raster, Bounds::around(&[c]).expand(radius), color, |x, y| {
                    dist2(x, y, c) <= radius * radius
                });
            }
            _ => {
                paint(raster, Bounds::around(points).expand(radius), color, |x, y| {
                    points
                        .windows(2)
                        .any(|seg| dist_to_segment(x, y, seg[0], seg[1]) <= radius)
                });
            }
        }
    }

    fn shape(&self, shape: &ShapePayload, raster: &mut Raster) {
        let Some(color) = parse_color(&shape.color) else {
            return;
        };
        let fill = shape.fill.as_deref().and_then(parse_color);
        let hw = half_width(shape.width);
        let bounds = Bounds::around(&[shape.start, shape.end]);

        match shape.shape {
            ShapeKind::Rectangle => {
                if let Some(fill) = fill {
                    paint(raster, bounds, fill, |x, y| bounds.contains(x, y));
                }
                let inner = bounds.expand(-hw);
                paint(raster, bounds.expand(hw), color, |x, y| {
                    !(inner.is_valid() && inner.contains(x, y))
                });
            }
            ShapeKind::Ellipse => {
                let (cx, cy) = bounds.center();
                let (rx, ry) = (bounds.width() / 2.0, bounds.height() / 2.0);
                let inside = move |x: f32, y: f32, rx: f32, ry: f32| {
                    if rx <= 0.0 || ry <= 0.0 {
                        return false;
                    }
                    let dx = (x - cx) / rx;
                    let dy = (y - cy) / ry;
                    dx * dx + dy * dy <= 1.0
                };
                if let Some(fill) = fill {
                    paint(raster, bounds, fill, |x, y| inside(x, y, rx, ry));
                }
                paint(raster, bounds.expand(hw), color, |x, y| {
                    inside(x, y, rx + hw, ry + hw) && !inside(x, y, rx - hw, ry - hw)
                });
            }
            ShapeKind::Line => {
                let (a, b) = (shape.start, shape.end);
                paint(raster, bounds.expand(hw), color, |x, y| {
                    dist_to_segment(x, y, a, b) <= hw
                });
            }
            ShapeKind::Arrow => {
                let segments = arrow_segments(shape.start, shape.end, shape.width);
                let head = Bounds::around(&[segments[1].1, segments[2].1]);
                paint(raster, bounds.union(head).expand(hw), color, |x, y| {
                    segments
                        .iter()
                        .any(|&(a, b)| dist_to_segment(x, y, a, b) <= hw)
                });
            }
            ShapeKind::Triangle => {
                let apex = Point::new((bounds.min_x + bounds.max_x) / 2.0, bounds.min_y);
                let left = Point::new(bounds.min_x, bounds.max_y);
                let right = Point::new(bounds.max_x, bounds.max_y);
                if let Some(fill) = fill {
                    paint(raster, bounds, fill, |x, y| in_triangle(x, y, apex, left, right));
                }
                let edges = [(apex, left), (left, right), (right, apex)];
                paint(raster, bounds.expand(hw), color, |x, y| {
                    edges.iter().any(|&(a, b)| dist_to_segment(x, y, a, b) <= hw)
                });
            }
        }
    }

    /// Text as one solid block per visible glyph.
    fn text(&self, text: &TextPayload, raster: &mut Raster) {
        let Some(color) = parse_color(&text.color) else {
            return;
        };
        let size = text.size.max(1.0);
        let glyph_w = size * 0.6;
        let advance = size * 0.7;
        let line_h = size * 1.2;

        let mut glyphs = Vec::new();
        let (mut x, mut y) = (text.position.x, text.position.y);
        for ch in text.content.chars() {
            if ch == '\n' {
                x = text.position.x;
                y += line_h;
                continue;
            }
            if !ch.is_whitespace() {
                glyphs.push(Bounds {
                    min_x: x,
                    min_y: y,
                    max_x: x + glyph_w,
                    max_y: y + size,
                });
            }
            x += advance;
        }

        let Some(bounds) = glyphs.iter().copied().reduce(Bounds::union) else {
            return;
        };
        paint(raster, bounds, color, |px, py| {
            glyphs.iter().any(|g| g.contains(px, py))
        });
    }
}

impl Renderer for FlatRenderer {
    fn render(&self, payload: &EventPayload, raster: &mut Raster) {
        match payload {
            EventPayload::Stroke(stroke) => self.stroke(stroke, raster),
            EventPayload::Shape(shape) => self.shape(shape, raster),
            EventPayload::Text(text) => self.text(text, raster),
            EventPayload::Clear { background_color } => {
                match background_color.as_deref().and_then(parse_color) {
                    Some(color) => raster.fill(color),
                    None => raster.reset(),
                }
            }
        }
    }
}

fn parse_color(s: &str) -> Option<Color> {
    match Color::parse(s) {
        Ok(color) => Some(color),
        Err(e) => {
            log::warn!("Skipping paint with invalid color: {e}");
            None
        }
    }
}

fn half_width(width: f32) -> f32 {
    (width / 2.0).max(0.5)
}

/// The shaft plus the two head barbs, each as a segment.
fn arrow_segments(start: Point, end: Point, width: f32) -> [(Point, Point); 3] {
    let head_len = (width * 4.0).max(8.0);
    let angle = (end.y - start.y).atan2(end.x - start.x);
    let barb = |offset: f32| {
        let a = angle + std::f32::consts::PI - offset;
        Point::new(end.x + head_len * a.cos(), end.y + head_len * a.sin())
    };
    let spread = std::f32::consts::FRAC_PI_6;
    [(start, end), (end, barb(spread)), (end, barb(-spread))]
}

// ─── Geometry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    min_x: f32,
    min_y: f32,
    max_x: f32,
    max_y: f32,
}

impl Bounds {
    fn around(points: &[Point]) -> Self {
        let mut b = Bounds {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        };
        for p in points {
            b.min_x = b.min_x.min(p.x);
            b.min_y = b.min_y.min(p.y);
            b.max_x = b.max_x.max(p.x);
            b.max_y = b.max_y.max(p.y);
        }
        b
    }

    fn expand(self, by: f32) -> Self {
        Bounds {
            min_x: self.min_x - by,
            min_y: self.min_y - by,
            max_x: self.max_x + by,
            max_y: self.max_y + by,
        }
    }

    fn union(self, other: Bounds) -> Self {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    fn center(&self) -> (f32, f32) {
        ((self.min_x + self.max_x) / 2.0, (self.min_y + self.max_y) / 2.0)
    }
}

/// Paint every pixel in `bounds` whose center is covered.
fn paint(raster: &mut Raster, bounds: Bounds, color: Color, covers: impl Fn(f32, f32) -> bool) {
    if !bounds.is_valid() || !bounds.min_x.is_finite() || !bounds.max_y.is_finite() {
        return;
    }
    let x0 = (bounds.min_x.floor() as i64).max(0);
    let y0 = (bounds.min_y.floor() as i64).max(0);
    let x1 = (bounds.max_x.ceil() as i64).min(raster.width() as i64 - 1);
    let y1 = (bounds.max_y.ceil() as i64).min(raster.height() as i64 - 1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            if covers(x as f32 + 0.5, y as f32 + 0.5) {
                raster.put(x, y, color);
            }
        }
    }
}

fn dist2(x: f32, y: f32, p: Point) -> f32 {
    let (dx, dy) = (x - p.x, y - p.y);
    dx * dx + dy * dy
}

fn dist_to_segment(x: f32, y: f32, a: Point, b: Point) -> f32 {
    let (abx, aby) = (b.x - a.x, b.y - a.y);
    let len2 = abx * abx + aby * aby;
    if len2 == 0.0 {
        return dist2(x, y, a).sqrt();
    }
    let t = (((x - a.x) * abx + (y - a.y) * aby) / len2).clamp(0.0, 1.0);
    dist2(x, y, Point::new(a.x + t * abx, a.y + t * aby)).sqrt()
}

fn in_triangle(x: f32, y: f32, a: Point, b: Point, c: Point) -> bool {
    let edge = |p: Point, q: Point| (q.x - p.x) * (y - p.y) - (q.y - p.y) * (x - p.x);
    let (d1, d2, d3) = (edge(a, b), edge(b, c), edge(c, a));
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Color = Color::rgb(255, 0, 0);

    fn raster() -> Raster {
        Raster::new(40, 40, Color::WHITE)
    }

    fn shape(kind: ShapeKind, fill: Option<&str>) -> EventPayload {
        EventPayload::Shape(ShapePayload {
            shape: kind,
            start: Point::new(5.0, 5.0),
            end: Point::new(35.0, 35.0),
            color: "#ff0000".into(),
            width: 2.0,
            fill: fill.map(String::from),
        })
    }

    #[test]
    fn test_stroke_paints_along_path() {
        let mut r = raster();
        let stroke = EventPayload::stroke(
            vec![Point::new(2.0, 20.0), Point::new(38.0, 20.0)],
            "#ff0000",
            4.0,
        );
        FlatRenderer.render(&stroke, &mut r);

        assert_eq!(r.pixel(20, 20), Some(RED));
        assert_eq!(r.pixel(20, 10), Some(Color::WHITE));
        assert!(r.count(RED) >= 36 * 4);
    }

    #[test]
    fn test_single_point_stroke_is_a_dot() {
        let mut r = raster();
        let dot = EventPayload::stroke(vec![Point::new(10.0, 10.0)], "#ff0000", 6.0);
        FlatRenderer.render(&dot, &mut r);
        assert_eq!(r.pixel(10, 10), Some(RED));
        assert!(r.count(RED) < 50);
    }

    #[test]
    fn test_translucent_polyline_blends_once() {
        let mut r = raster();
        let stroke = EventPayload::stroke(
            vec![
                Point::new(5.0, 20.0),
                Point::new(20.0, 20.0),
                Point::new(35.0, 20.0),
            ],
            "#00000080",
            4.0,
        );
        FlatRenderer.render(&stroke, &mut r);
        // The joint and the middle of a segment get the same single blend.
        assert_eq!(r.pixel(20, 20), r.pixel(10, 20));
    }

    #[test]
    fn test_eraser_paints_background() {
        let mut r = raster();
        r.fill(Color::BLACK);
        FlatRenderer.render(&shape(ShapeKind::Rectangle, Some("#ff0000")), &mut r);
        assert_eq!(r.pixel(20, 20), Some(RED));

        let eraser = EventPayload::Stroke(StrokePayload {
            points: vec![Point::new(10.0, 20.0), Point::new(30.0, 20.0)],
            color: "#ffffff".into(),
            width: 6.0,
            tool: StrokeTool::Eraser,
        });
        FlatRenderer.render(&eraser, &mut r);
        assert_eq!(r.pixel(20, 20), Some(Color::BLACK));
    }

    #[test]
    fn test_rectangle_outline_and_fill() {
        let mut outline = raster();
        FlatRenderer.render(&shape(ShapeKind::Rectangle, None), &mut outline);
        assert_eq!(outline.pixel(5, 20), Some(RED));
        assert_eq!(outline.pixel(20, 20), Some(Color::WHITE));

        let mut filled = raster();
        FlatRenderer.render(&shape(ShapeKind::Rectangle, Some("#0000ff")), &mut filled);
        assert_eq!(filled.pixel(20, 20), Some(Color::rgb(0, 0, 255)));
        assert_eq!(filled.pixel(5, 20), Some(RED));
        assert_eq!(filled.pixel(1, 1), Some(Color::WHITE));
    }

    #[test]
    fn test_ellipse_leaves_corners_empty() {
        let mut r = raster();
        FlatRenderer.render(&shape(ShapeKind::Ellipse, Some("#0000ff")), &mut r);
        assert_eq!(r.pixel(20, 20), Some(Color::rgb(0, 0, 255)));
        assert_eq!(r.pixel(6, 6), Some(Color::WHITE));
        assert_eq!(r.pixel(20, 5), Some(RED));
    }

    #[test]
    fn test_triangle_fill() {
        let mut r = raster();
        FlatRenderer.render(&shape(ShapeKind::Triangle, Some("#0000ff")), &mut r);
        assert_eq!(r.pixel(20, 30), Some(Color::rgb(0, 0, 255)));
        assert_eq!(r.pixel(8, 10), Some(Color::WHITE));
    }

    #[test]
    fn test_line_and_arrow() {
        let mut line = raster();
        FlatRenderer.render(&shape(ShapeKind::Line, None), &mut line);
        assert_eq!(line.pixel(20, 20), Some(RED));
        assert_eq!(line.pixel(30, 10), Some(Color::WHITE));

        let mut arrow = raster();
        FlatRenderer.render(&shape(ShapeKind::Arrow, None), &mut arrow);
        assert!(arrow.count(RED) > line.count(RED));
    }

    #[test]
    fn test_text_blocks() {
        let mut r = raster();
        let text = EventPayload::Text(TextPayload {
            position: Point::new(2.0, 2.0),
            content: "a b".into(),
            color: "#ff0000".into(),
            size: 10.0,
        });
        FlatRenderer.render(&text, &mut r);
        // First glyph, gap for the space, third glyph.
        assert_eq!(r.pixel(4, 6), Some(RED));
        assert_eq!(r.pixel(10, 6), Some(Color::WHITE));
        assert_eq!(r.pixel(17, 6), Some(RED));
    }

    #[test]
    fn test_clear_with_and_without_color() {
        let mut r = raster();
        FlatRenderer.render(
            &EventPayload::Clear {
                background_color: Some("#000000".into()),
            },
            &mut r,
        );
        assert_eq!(r.count(Color::BLACK), 40 * 40);

        FlatRenderer.render(&EventPayload::clear(), &mut r);
        assert_eq!(r.count(Color::WHITE), 40 * 40);
    }

    #[test]
    fn test_invalid_color_paints_nothing() {
        let mut r = raster();
        let stroke = EventPayload::stroke(
            vec![Point::new(0.0, 0.0), Point::new(30.0, 30.0)],
            "red",
            3.0,
        );
        FlatRenderer.render(&stroke, &mut r);
        assert_eq!(r, raster());
    }

    #[test]
    fn test_offscreen_shapes_are_clipped() {
        let mut r = raster();
        let stroke = EventPayload::stroke(
            vec![Point::new(-100.0, -100.0), Point::new(100.0, 100.0)],
            "#ff0000",
            2.0,
        );
        FlatRenderer.render(&stroke, &mut r);
        assert_eq!(r.pixel(0, 0), Some(RED));
        assert_eq!(r.pixel(39, 39), Some(RED));
    }
}
