//! Text renderings of images and probabilities.
//!
//!```
//! # use gradnotes::viz::heatmap;
//! # use ndarray::array;
//! let map = heatmap(array![[0., 1.], [0.5, 0.]].view());
//! assert_eq!(map, " @\n+ \n");
//!```
use ndarray::{ArrayView1, ArrayView2, ArrayView3, Axis};
use std::fmt::Write;

const RAMP: &[u8] = b" .:-=+*#%@";

/// Renders `values` with one character per element, from ' ' (min) to '@' (max).
///
/// Each row ends with a newline. Constant inputs render as blank.
pub fn heatmap(values: ArrayView2<f32>) -> String {
    let (min, max) = values
        .iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), x| {
            (min.min(x), max.max(x))
        });
    let range = max - min;
    let mut output = String::with_capacity(values.len() + values.nrows());
    for row in values.outer_iter() {
        for x in row.iter() {
            let level = if range > 0. && x.is_finite() {
                (((x - min) / range) * (RAMP.len() - 1) as f32).round() as usize
            } else {
                0
            };
            output.push(RAMP[level.min(RAMP.len() - 1)] as char);
        }
        output.push('\n');
    }
    output
}

/// Renders (n, h, w) images side by side, `columns` per line, separated by a blank column.
///
/// Each image is normalized independently.
pub fn image_grid(images: ArrayView3<f32>, columns: usize) -> String {
    let columns = columns.max(1);
    let maps: Vec<Vec<String>> = images
        .outer_iter()
        .map(|image| heatmap(image).lines().map(String::from).collect())
        .collect();
    let mut output = String::new();
    for chunk in maps.chunks(columns) {
        for line in 0..images.len_of(Axis(1)) {
            let row: Vec<&str> = chunk
                .iter()
                .map(|map| map.get(line).map_or("", String::as_str))
                .collect();
            let _ = writeln!(output, "{}", row.join(" "));
        }
        output.push('\n');
    }
    output
}

/// Renders a labeled bar per probability.
pub fn probability_bars(probabilities: ArrayView1<f32>, labels: &[&str]) -> String {
    const WIDTH: usize = 40;
    let label_width = labels.iter().map(|label| label.len()).max().unwrap_or(0);
    let mut output = String::new();
    for (i, p) in probabilities.iter().enumerate() {
        let label = labels.get(i).copied().map_or_else(|| i.to_string(), String::from);
        let filled = (p.clamp(0., 1.) * WIDTH as f32).round() as usize;
        let _ = writeln!(
            output,
            "{label:>label_width$} |{}{}| {:5.1}%",
            "#".repeat(filled),
            " ".repeat(WIDTH - filled),
            p * 100.,
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn heatmap_ramp() {
        let map = heatmap(array![[0., 0.25, 0.5, 1.]].view());
        assert_eq!(map, " :+@\n");
        let constant = heatmap(array![[3., 3.], [3., 3.]].view());
        assert_eq!(constant, "  \n  \n");
    }

    #[test]
    fn grid_layout() {
        let images = Array3::from_shape_fn([3, 2, 2], |(n, y, x)| (n + y + x) as f32);
        let grid = image_grid(images.view(), 2);
        let lines: Vec<&str> = grid.lines().collect();
        // two rows of images, each followed by a blank line
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0].chars().count(), 5);
        assert_eq!(lines[2], "");
    }

    #[test]
    fn bars() {
        let bars = probability_bars(array![0.25, 0.75].view(), &["cat", "dog"]);
        let lines: Vec<&str> = bars.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("cat |##########"));
        assert!(lines[1].ends_with(" 75.0%"));
        let unlabeled = probability_bars(array![1.].view(), &[]);
        assert!(unlabeled.starts_with("0 |"));
    }
}
