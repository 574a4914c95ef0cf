//! Haar cascade face localizer
//!
//! Reads the OpenCV "new format" cascade XML (`<cascade>` with `<stages>` and
//! `<features>`) and evaluates it over an image pyramid. The evaluation follows
//! the usual Viola-Jones scheme:
//!
//! - integral and squared-integral images per pyramid level
//! - per window, feature sums are divided by the standard deviation of the
//!   window interior (the "variance normalisation factor")
//! - each stage sums the leaf values of its weak trees and rejects the window
//!   as soon as the sum falls below the stage threshold
//!
//! Raw hits are merged with [`group_rectangles`], which keeps clusters backed
//! by more than `min_neighbors` hits.

use std::path::Path;

use image::GrayImage;
use roxmltree::{Document, Node};

use super::{DetectorError, FaceLocalizer, FaceRegion};

/// Relative tolerance used when merging overlapping detections
const GROUP_EPS: f64 = 0.2;

/// Detection parameters for one cascade pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    /// Ratio between successive pyramid levels (> 1.0)
    pub scale_step: f32,
    /// Neighbouring raw hits required to keep a face (0 = no grouping)
    pub min_neighbors: u32,
    /// Smallest window considered
    pub min_size: (u32, u32),
    /// Largest window considered; (0, 0) means the whole image
    pub max_size: (u32, u32),
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            scale_step: 1.1,
            min_neighbors: 2,
            min_size: (30, 30),
            max_size: (0, 0),
        }
    }
}

#[derive(Debug, Clone)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakTree {
    nodes: Vec<TreeNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<WeakTree>,
}

/// A boosted Haar cascade
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::CascadeLoad(format!("{}: {}", path.display(), e)))?;
        let cascade = Self::from_xml(&text)
            .map_err(|e| DetectorError::CascadeLoad(format!("{}: {}", path.display(), e)))?;
        log::info!(
            "[Detector] Loaded cascade {} ({} stages, {}x{} window)",
            path.display(),
            cascade.stages.len(),
            cascade.window.0,
            cascade.window.1
        );
        Ok(cascade)
    }

    pub fn from_xml(text: &str) -> Result<Self, DetectorError> {
        let doc = Document::parse(text).map_err(|e| DetectorError::CascadeLoad(e.to_string()))?;
        let root = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| format_error("no <cascade> element (old-style cascades are not supported)"))?;

        if let Some(kind) = child(root, "featureType") {
            if text_of(kind).trim() != "HAAR" {
                return Err(format_error("only HAAR feature cascades are supported"));
            }
        }

        let width = parse_number::<u32>(text_of(required(root, "width")?).trim())?;
        let height = parse_number::<u32>(text_of(required(root, "height")?).trim())?;
        if width < 3 || height < 3 {
            return Err(format_error("window must be at least 3x3"));
        }

        let mut features = Vec::new();
        for feature in items(required(root, "features")?) {
            features.push(parse_feature(feature, width, height)?);
        }

        let mut stages = Vec::new();
        for stage in items(required(root, "stages")?) {
            let threshold = parse_number::<f64>(text_of(required(stage, "stageThreshold")?).trim())?;
            let mut trees = Vec::new();
            for weak in items(required(stage, "weakClassifiers")?) {
                trees.push(parse_tree(weak, features.len())?);
            }
            stages.push(Stage { threshold, trees });
        }
        if stages.is_empty() {
            return Err(format_error("cascade has no stages"));
        }

        Ok(Self {
            window: (width, height),
            stages,
            features,
        })
    }

    pub fn window_size(&self) -> (u32, u32) {
        self.window
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Raw (ungrouped) hits over the whole pyramid
    fn scan(&self, gray: &GrayImage, params: &CascadeParams) -> Vec<FaceRegion> {
        let (image_w, image_h) = gray.dimensions();
        let (win_w, win_h) = self.window;
        let max_size = if params.max_size.0 == 0 || params.max_size.1 == 0 {
            (image_w, image_h)
        } else {
            params.max_size
        };
        let scale_step = (params.scale_step as f64).max(1.01);

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;
            let scaled_w = (image_w as f64 / factor).round() as u32;
            let scaled_h = (image_h as f64 / factor).round() as u32;

            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            if window_w > max_size.0 || window_h > max_size.1 {
                break;
            }
            if window_w >= params.min_size.0 && window_h >= params.min_size.1 {
                let integral = if scaled_w == image_w && scaled_h == image_h {
                    Integral::new(gray)
                } else {
                    let scaled = image::imageops::resize(
                        gray,
                        scaled_w,
                        scaled_h,
                        image::imageops::FilterType::Triangle,
                    );
                    Integral::new(&scaled)
                };

                let step = if factor > 2.0 { 1 } else { 2 };
                for y in (0..=scaled_h - win_h).step_by(step) {
                    for x in (0..=scaled_w - win_w).step_by(step) {
                        if self.accepts(&integral, x, y) {
                            hits.push(FaceRegion {
                                x: (x as f64 * factor).round() as u32,
                                y: (y as f64 * factor).round() as u32,
                                width: window_w,
                                height: window_h,
                            });
                        }
                    }
                }
            }

            factor *= scale_step;
        }
        hits
    }

    /// Run every stage on the window whose top-left corner is (x, y)
    fn accepts(&self, integral: &Integral, x: u32, y: u32) -> bool {
        let (win_w, win_h) = self.window;
        let area = ((win_w - 2) * (win_h - 2)) as f64;
        let sum = integral.sum(x + 1, y + 1, win_w - 2, win_h - 2) as f64;
        let sq_sum = integral.sq_sum(x + 1, y + 1, win_w - 2, win_h - 2) as f64;
        let variance = area * sq_sum - sum * sum;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0;
            for tree in &stage.trees {
                let mut idx: i32 = 0;
                loop {
                    let node = &tree.nodes[idx as usize];
                    let value = self.feature_value(integral, node.feature, x, y) / norm;
                    idx = if value < node.threshold { node.left } else { node.right };
                    if idx <= 0 {
                        break;
                    }
                }
                stage_sum += tree.leaves[(-idx) as usize];
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn feature_value(&self, integral: &Integral, feature: usize, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Cascade plus the parameters it runs with
pub struct CascadeLocalizer {
    cascade: HaarCascade,
    params: CascadeParams,
}

impl CascadeLocalizer {
    pub fn new(cascade: HaarCascade, params: CascadeParams) -> Self {
        Self { cascade, params }
    }
}

impl FaceLocalizer for CascadeLocalizer {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let hits = self.cascade.scan(gray, &self.params);
        group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS)
    }
}

// ============================================================================
// Integral images
// ============================================================================

struct Integral {
    stride: usize,
    sums: Vec<i64>,
    sq_sums: Vec<u64>,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = gray.dimensions();
        let stride = w as usize + 1;
        let mut sums = vec![0i64; stride * (h as usize + 1)];
        let mut sq_sums = vec![0u64; stride * (h as usize + 1)];

        for y in 0..h as usize {
            let mut row_sum = 0i64;
            let mut row_sq = 0u64;
            for x in 0..w as usize {
                let v = gray.get_pixel(x as u32, y as u32).0[0];
                row_sum += v as i64;
                row_sq += (v as u64) * (v as u64);
                let at = (y + 1) * stride + x + 1;
                sums[at] = sums[at - stride] + row_sum;
                sq_sums[at] = sq_sums[at - stride] + row_sq;
            }
        }

        Self { stride, sums, sq_sums }
    }

    fn corners(&self, x: u32, y: u32, w: u32, h: u32) -> [usize; 4] {
        let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
        [
            y * self.stride + x,
            y * self.stride + x + w,
            (y + h) * self.stride + x,
            (y + h) * self.stride + x + w,
        ]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        self.sums[br] - self.sums[tr] - self.sums[bl] + self.sums[tl]
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let [tl, tr, bl, br] = self.corners(x, y, w, h);
        (self.sq_sums[br] + self.sq_sums[tl]) - (self.sq_sums[tr] + self.sq_sums[bl])
    }
}

// ============================================================================
// Grouping
// ============================================================================

fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar rectangles, average each cluster and keep those with more
/// than `threshold` members. Clusters lying inside a stronger cluster are dropped.
/// A threshold of 0 returns the input unchanged.
pub fn group_rectangles(rects: &[FaceRegion], threshold: u32, eps: f64) -> Vec<FaceRegion> {
    if threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in 0..i {
            if similar(&rects[i], &rects[j], eps) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a] = b;
                }
            }
        }
    }

    // root index -> (sum x, sum y, sum w, sum h, count)
    let mut clusters: Vec<(usize, [u64; 4], u32)> = Vec::new();
    for (i, rect) in rects.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = match clusters.iter().position(|(r, _, _)| *r == root) {
            Some(slot) => slot,
            None => {
                clusters.push((root, [0; 4], 0));
                clusters.len() - 1
            }
        };
        let entry = &mut clusters[slot];
        entry.1[0] += rect.x as u64;
        entry.1[1] += rect.y as u64;
        entry.1[2] += rect.width as u64;
        entry.1[3] += rect.height as u64;
        entry.2 += 1;
    }

    let averaged: Vec<(FaceRegion, u32)> = clusters
        .iter()
        .map(|(_, sums, count)| {
            let n = *count as f64;
            let avg = |s: u64| (s as f64 / n).round() as u32;
            (
                FaceRegion {
                    x: avg(sums[0]),
                    y: avg(sums[1]),
                    width: avg(sums[2]),
                    height: avg(sums[3]),
                },
                *count,
            )
        })
        .collect();

    let mut kept = Vec::new();
    for (i, (r1, n1)) in averaged.iter().enumerate() {
        if *n1 <= threshold {
            continue;
        }
        let swallowed = averaged.iter().enumerate().any(|(j, (r2, n2))| {
            if i == j || *n2 <= threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (*n2 > (*n1).max(3) || *n1 < 3)
        });
        if !swallowed {
            kept.push(*r1);
        }
    }
    kept
}

// ============================================================================
// XML helpers
// ============================================================================

fn format_error(reason: &str) -> DetectorError {
    DetectorError::CascadeLoad(reason.to_string())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn required<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, DetectorError> {
    child(node, name).ok_or_else(|| DetectorError::CascadeLoad(format!("missing <{}>", name)))
}

/// The `<_>` list entries under a node
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn text_of<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("")
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Result<T, DetectorError> {
    token
        .parse::<T>()
        .map_err(|_| DetectorError::CascadeLoad(format!("bad number '{}'", token)))
}

fn parse_feature(node: Node, win_w: u32, win_h: u32) -> Result<HaarFeature, DetectorError> {
    if let Some(tilted) = child(node, "tilted") {
        if text_of(tilted).trim() != "0" {
            return Err(format_error("tilted Haar features are not supported"));
        }
    }

    let mut rects = Vec::new();
    for rect in items(required(node, "rects")?) {
        let tokens: Vec<&str> = text_of(rect).split_whitespace().collect();
        if tokens.len() != 5 {
            return Err(DetectorError::CascadeLoad(format!(
                "feature rect needs 5 values, got '{}'",
                text_of(rect).trim()
            )));
        }
        let rect = WeightedRect {
            x: parse_number(tokens[0])?,
            y: parse_number(tokens[1])?,
            width: parse_number(tokens[2])?,
            height: parse_number(tokens[3])?,
            weight: parse_number(tokens[4])?,
        };
        if rect.x + rect.width > win_w || rect.y + rect.height > win_h {
            return Err(format_error("feature rect lies outside the window"));
        }
        rects.push(rect);
    }
    if rects.is_empty() {
        return Err(format_error("feature without rects"));
    }
    Ok(HaarFeature { rects })
}

fn parse_tree(node: Node, feature_count: usize) -> Result<WeakTree, DetectorError> {
    let tokens: Vec<&str> = text_of(required(node, "internalNodes")?)
        .split_whitespace()
        .collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(format_error("internalNodes must hold groups of 4 values"));
    }

    let leaves = text_of(required(node, "leafValues")?)
        .split_whitespace()
        .map(parse_number::<f64>)
        .collect::<Result<Vec<_>, _>>()?;

    let mut nodes = Vec::with_capacity(tokens.len() / 4);
    for group in tokens.chunks(4) {
        let node = TreeNode {
            left: parse_number(group[0])?,
            right: parse_number(group[1])?,
            feature: parse_number(group[2])?,
            threshold: parse_number(group[3])?,
        };
        if node.feature >= feature_count {
            return Err(format_error("weak classifier references a missing feature"));
        }
        nodes.push(node);
    }

    // Children are node indices (> 0) or negated leaf indices (<= 0)
    for node in &nodes {
        for link in [node.left, node.right] {
            let valid = if link > 0 {
                (link as usize) < nodes.len()
            } else {
                ((-link) as usize) < leaves.len()
            };
            if !valid {
                return Err(format_error("weak classifier link out of range"));
            }
        }
    }

    Ok(WeakTree { nodes, leaves })
}
