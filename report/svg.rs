//! Minimal SVG drawing for the diagnostic plots.

use crate::forest::tree::{Node, Tree};
use crate::policy::{PolicyNode, PolicyTree, action_label, variable_label};
use std::fmt::Write as FmtWrite;

const FONT: &str = "Helvetica, Arial, sans-serif";
const BAR_FILL: &str = "#4c72b0";
const AXIS: &str = "#333333";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Middle,
    End,
}

impl Anchor {
    fn as_str(self) -> &'static str {
        match self {
            Anchor::Middle => "middle",
            Anchor::End => "end",
        }
    }
}

enum Element {
    Rect {
        x: f64,
        y: f64,
        w: f64,
        h: f64,
        fill: &'static str,
        stroke: Option<&'static str>,
    },
    Line {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        stroke: &'static str,
    },
    Text {
        x: f64,
        y: f64,
        content: String,
        size: f64,
        anchor: Anchor,
    },
}

/// Collects elements and serialises them in drawing order.
pub struct Canvas {
    width: f64,
    height: f64,
    elements: Vec<Element>,
}

impl Canvas {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            elements: Vec::new(),
        }
    }

    pub fn rect(&mut self, x: f64, y: f64, w: f64, h: f64, fill: &'static str, stroke: Option<&'static str>) {
        self.elements.push(Element::Rect {
            x,
            y,
            w,
            h,
            fill,
            stroke,
        });
    }

    pub fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, stroke: &'static str) {
        self.elements.push(Element::Line {
            x1,
            y1,
            x2,
            y2,
            stroke,
        });
    }

    pub fn text(&mut self, x: f64, y: f64, content: impl Into<String>, size: f64, anchor: Anchor) {
        self.elements.push(Element::Text {
            x,
            y,
            content: content.into(),
            size,
            anchor,
        });
    }

    pub fn finish(&self) -> String {
        let mut out = String::with_capacity(16 * 1024);
        let _ = writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = self.width,
            h = self.height,
        );
        let _ = writeln!(
            out,
            r#"<rect width="{}" height="{}" fill="white" />"#,
            self.width, self.height
        );
        for element in &self.elements {
            render(&mut out, element);
        }
        out.push_str("</svg>\n");
        out
    }
}

fn render(out: &mut String, element: &Element) {
    match element {
        Element::Rect {
            x,
            y,
            w,
            h,
            fill,
            stroke,
        } => {
            let _ = write!(
                out,
                r#"<rect x="{x:.2}" y="{y:.2}" width="{w:.2}" height="{h:.2}" fill="{fill}""#
            );
            if let Some(stroke) = stroke {
                let _ = write!(out, r#" stroke="{stroke}" stroke-width="1""#);
            }
            out.push_str(" />\n");
        }
        Element::Line {
            x1,
            y1,
            x2,
            y2,
            stroke,
        } => {
            let _ = writeln!(
                out,
                r#"<line x1="{x1:.2}" y1="{y1:.2}" x2="{x2:.2}" y2="{y2:.2}" stroke="{stroke}" stroke-width="1" />"#
            );
        }
        Element::Text {
            x,
            y,
            content,
            size,
            anchor,
        } => {
            let _ = write!(
                out,
                r#"<text x="{x:.2}" y="{y:.2}" font-family="{FONT}" font-size="{size:.1}" text-anchor="{}">"#,
                anchor.as_str()
            );
            for ch in content.chars() {
                match ch {
                    '<' => out.push_str("&lt;"),
                    '>' => out.push_str("&gt;"),
                    '&' => out.push_str("&amp;"),
                    '"' => out.push_str("&quot;"),
                    _ => out.push(ch),
                }
            }
            out.push_str("</text>\n");
        }
    }
}

/// Equal-width bin counts over `[min, max]`. The maximum lands in the last bin.
pub fn bin_counts(values: &[f64], bins: usize) -> (f64, f64, Vec<usize>) {
    let bins = bins.max(1);
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let mut counts = vec![0; bins];
    if values.is_empty() {
        return (0.0, 0.0, counts);
    }
    let width = max - min;
    for &value in values {
        let index = if width > 0.0 {
            (((value - min) / width) * bins as f64).floor() as usize
        } else {
            0
        };
        counts[index.min(bins - 1)] += 1;
    }
    (min, max, counts)
}

/// Histogram of `values` with `bins` equal-width bars.
pub fn histogram(values: &[f64], bins: usize, title: &str, x_label: &str) -> String {
    let (width, height) = (640.0, 420.0);
    let (left, right, top, bottom) = (60.0, 20.0, 40.0, 60.0);
    let plot_w = width - left - right;
    let plot_h = height - top - bottom;

    let (min, max, counts) = bin_counts(values, bins);
    let tallest = counts.iter().copied().max().unwrap_or(0).max(1) as f64;
    let bar_w = plot_w / counts.len() as f64;

    let mut canvas = Canvas::new(width, height);
    canvas.text(width / 2.0, 24.0, title, 16.0, Anchor::Middle);
    for (i, &count) in counts.iter().enumerate() {
        let h = plot_h * count as f64 / tallest;
        canvas.rect(
            left + i as f64 * bar_w,
            top + plot_h - h,
            bar_w,
            h,
            BAR_FILL,
            Some("white"),
        );
    }

    canvas.line(left, top + plot_h, left + plot_w, top + plot_h, AXIS);
    canvas.line(left, top, left, top + plot_h, AXIS);
    for tick in 0..=4 {
        let fraction = tick as f64 / 4.0;
        let x = left + fraction * plot_w;
        canvas.line(x, top + plot_h, x, top + plot_h + 5.0, AXIS);
        canvas.text(
            x,
            top + plot_h + 20.0,
            format!("{:.3}", min + fraction * (max - min)),
            11.0,
            Anchor::Middle,
        );
        let y = top + plot_h - fraction * plot_h;
        canvas.line(left - 5.0, y, left, y, AXIS);
        canvas.text(
            left - 8.0,
            y + 4.0,
            format!("{:.0}", fraction * tallest),
            11.0,
            Anchor::End,
        );
    }
    canvas.text(left + plot_w / 2.0, height - 15.0, x_label, 13.0, Anchor::Middle);
    canvas.finish()
}

/// Boxes-and-lines drawing of a policy tree, root at the top.
pub fn policy_tree(tree: &PolicyTree, names: &[String], arms: &[&str]) -> String {
    let leaves = tree.leaves().len().max(1);
    let levels = tree.leaves().iter().map(|l| l.depth).max().unwrap_or(0) + 1;
    let slot_w = 170.0;
    let level_h = 90.0;
    let width = (leaves as f64 * slot_w).max(340.0);
    let height = levels as f64 * level_h + 40.0;

    let mut canvas = Canvas::new(width, height);
    canvas.text(width / 2.0, 22.0, format!("Policy tree (depth {})", tree.depth()), 15.0, Anchor::Middle);
    let mut next_leaf = 0usize;
    layout(
        &mut canvas,
        tree.root(),
        0,
        &mut next_leaf,
        &Geometry {
            slot_w,
            level_h,
            names,
            arms,
        },
    );
    canvas.finish()
}

struct Geometry<'a> {
    slot_w: f64,
    level_h: f64,
    names: &'a [String],
    arms: &'a [&'a str],
}

/// Draws `node` and returns the x coordinate of its centre.
fn layout(canvas: &mut Canvas, node: &PolicyNode, depth: usize, next_leaf: &mut usize, geo: &Geometry<'_>) -> f64 {
    let (box_w, box_h) = (150.0, 40.0);
    let y = 40.0 + depth as f64 * geo.level_h;
    match node {
        PolicyNode::Leaf { action, samples } => {
            let x = (*next_leaf as f64 + 0.5) * geo.slot_w;
            *next_leaf += 1;
            canvas.rect(x - box_w / 2.0, y, box_w, box_h, "#dfe9f5", Some(AXIS));
            canvas.text(
                x,
                y + 17.0,
                format!("action = {}", action_label(geo.arms, *action)),
                12.0,
                Anchor::Middle,
            );
            canvas.text(x, y + 32.0, format!("n = {samples}"), 11.0, Anchor::Middle);
            x
        }
        PolicyNode::Split {
            variable,
            threshold,
            left,
            right,
        } => {
            let left_x = layout(canvas, left, depth + 1, next_leaf, geo);
            let right_x = layout(canvas, right, depth + 1, next_leaf, geo);
            let x = (left_x + right_x) / 2.0;
            let child_y = y + geo.level_h;
            canvas.line(x, y + box_h, left_x, child_y, AXIS);
            canvas.line(x, y + box_h, right_x, child_y, AXIS);
            canvas.rect(x - box_w / 2.0, y, box_w, box_h, "white", Some(AXIS));
            canvas.text(
                x,
                y + 24.0,
                format!("{} <= {threshold:.3}", variable_label(geo.names, *variable)),
                12.0,
                Anchor::Middle,
            );
            x
        }
    }
}

/// Drawing of one fitted forest tree. Leaves show how many estimation rows they hold.
pub fn forest_tree(tree: &Tree, names: &[String], index: usize) -> String {
    let mut levels = 0usize;
    tree.visit(|depth, _| levels = levels.max(depth + 1));
    let slot_w = 110.0;
    let level_h = 70.0;
    let width = (tree.num_leaves().max(1) as f64 * slot_w).max(340.0);
    let height = levels as f64 * level_h + 40.0;

    let mut canvas = Canvas::new(width, height);
    canvas.text(width / 2.0, 22.0, format!("Forest tree {index}"), 15.0, Anchor::Middle);
    let mut next_leaf = 0usize;
    forest_layout(&mut canvas, tree.nodes(), 0, 0, &mut next_leaf, (slot_w, level_h), names);
    canvas.finish()
}

fn forest_layout(
    canvas: &mut Canvas,
    nodes: &[Node],
    index: usize,
    depth: usize,
    next_leaf: &mut usize,
    (slot_w, level_h): (f64, f64),
    names: &[String],
) -> f64 {
    let (box_w, box_h) = (100.0, 32.0);
    let y = 40.0 + depth as f64 * level_h;
    match &nodes[index] {
        Node::Leaf { samples } => {
            let x = (*next_leaf as f64 + 0.5) * slot_w;
            *next_leaf += 1;
            canvas.rect(x - box_w / 2.0, y, box_w, box_h, "#e8f0e0", Some(AXIS));
            canvas.text(x, y + 20.0, format!("n = {}", samples.len()), 11.0, Anchor::Middle);
            x
        }
        Node::Split {
            variable,
            threshold,
            left,
            right,
        } => {
            let left_x = forest_layout(canvas, nodes, *left, depth + 1, next_leaf, (slot_w, level_h), names);
            let right_x = forest_layout(canvas, nodes, *right, depth + 1, next_leaf, (slot_w, level_h), names);
            let x = (left_x + right_x) / 2.0;
            let child_y = y + level_h;
            canvas.line(x, y + box_h, left_x, child_y, AXIS);
            canvas.line(x, y + box_h, right_x, child_y, AXIS);
            canvas.rect(x - box_w / 2.0, y, box_w, box_h, "white", Some(AXIS));
            canvas.text(
                x,
                y + 20.0,
                format!("{} <= {threshold:.3}", variable_label(names, *variable)),
                11.0,
                Anchor::Middle,
            );
            x
        }
    }
}
