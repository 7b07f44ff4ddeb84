//! Array kernels for convolution and pooling, parallel over the batch.
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Zip};

#[derive(Clone, Copy, Debug)]
pub struct Conv2Options {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub padding: [usize; 2],
}

impl Conv2Options {
    /// The output height and width for an input of `[h, w]`, if the padded input fits the kernel.
    pub fn output_shape(&self, [h, w]: [usize; 2]) -> Option<[usize; 2]> {
        let [kh, kw] = self.kernel;
        let [sh, sw] = self.strides;
        let [ph, pw] = self.padding;
        let (h, w) = (h + 2 * ph, w + 2 * pw);
        if h < kh || w < kw || sh == 0 || sw == 0 {
            return None;
        }
        Some([(h - kh) / sh + 1, (w - kw) / sw + 1])
    }
    fn input_index(
        &self,
        [oy, ox]: [usize; 2],
        [ky, kx]: [usize; 2],
        [h, w]: [usize; 2],
    ) -> Option<[usize; 2]> {
        let y = (oy * self.strides[0] + ky).checked_sub(self.padding[0])?;
        let x = (ox * self.strides[1] + kx).checked_sub(self.padding[1])?;
        if y < h && x < w {
            Some([y, x])
        } else {
            None
        }
    }
}

/// Unfolds `input` (n, c, h, w) into (n, oh * ow, c * kh * kw) patches.
pub(super) fn im2col(input: ArrayView4<f32>, options: &Conv2Options) -> Array3<f32> {
    let (n, c, h, w) = input.dim();
    let [kh, kw] = options.kernel;
    let [oh, ow] = options.output_shape([h, w]).unwrap_or([0, 0]);
    let mut cols = Array3::zeros([n, oh * ow, c * kh * kw]);
    Zip::from(cols.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut cols, x| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut row = cols.row_mut(oy * ow + ox);
                    for ci in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                if let Some([iy, ix]) =
                                    options.input_index([oy, ox], [ky, kx], [h, w])
                                {
                                    row[(ci * kh + ky) * kw + kx] = x[[ci, iy, ix]];
                                }
                            }
                        }
                    }
                }
            }
        });
    cols
}

/// Folds patch gradients back into an input gradient of `[n, c, h, w]`, summing overlaps.
pub(super) fn col2im(
    cols: ArrayView3<f32>,
    [n, c, h, w]: [usize; 4],
    options: &Conv2Options,
) -> Array4<f32> {
    let [kh, kw] = options.kernel;
    let [oh, ow] = options.output_shape([h, w]).unwrap_or([0, 0]);
    let mut input_grad = Array4::zeros([n, c, h, w]);
    Zip::from(input_grad.outer_iter_mut())
        .and(cols.outer_iter())
        .par_for_each(|mut dx, cols| {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = cols.row(oy * ow + ox);
                    for ci in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                if let Some([y, x]) =
                                    options.input_index([oy, ox], [ky, kx], [h, w])
                                {
                                    dx[[ci, y, x]] += row[(ci * kh + ky) * kw + kx];
                                }
                            }
                        }
                    }
                }
            }
        });
    input_grad
}

/// Max pooling, returning the output and the flat (y * w + x) index of each max.
pub(super) fn max_pool2(
    input: ArrayView4<f32>,
    options: &Conv2Options,
) -> (Array4<f32>, Array4<usize>) {
    let (n, c, h, w) = input.dim();
    let [kh, kw] = options.kernel;
    let [oh, ow] = options.output_shape([h, w]).unwrap_or([0, 0]);
    let mut output = Array4::zeros([n, c, oh, ow]);
    let mut indices = Array4::zeros([n, c, oh, ow]);
    Zip::from(output.outer_iter_mut())
        .and(indices.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut y, mut indices, x| {
            for ci in 0..c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut max = f32::NEG_INFINITY;
                        let mut index = 0;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                if let Some([iy, ix]) =
                                    options.input_index([oy, ox], [ky, kx], [h, w])
                                {
                                    let value = x[[ci, iy, ix]];
                                    if value > max {
                                        max = value;
                                        index = iy * w + ix;
                                    }
                                }
                            }
                        }
                        y[[ci, oy, ox]] = max;
                        indices[[ci, oy, ox]] = index;
                    }
                }
            }
        });
    (output, indices)
}

/// Routes each output gradient to the input that was the max.
pub(super) fn max_pool2_backward(
    output_grad: ArrayView4<f32>,
    indices: ArrayView4<usize>,
    [n, c, h, w]: [usize; 4],
) -> Array4<f32> {
    let mut input_grad = Array4::zeros([n, c, h, w]);
    Zip::from(input_grad.outer_iter_mut())
        .and(output_grad.outer_iter())
        .and(indices.outer_iter())
        .par_for_each(|mut dx, dy, indices| {
            Zip::indexed(dy).and(indices).for_each(|(ci, _, _), dy, index| {
                dx[[ci, index / w, index % w]] += *dy;
            });
        });
    input_grad
}

/// Mean pooling. Padding counts towards the window size.
pub(super) fn mean_pool2(input: ArrayView4<f32>, options: &Conv2Options) -> Array4<f32> {
    let (n, c, h, w) = input.dim();
    let [kh, kw] = options.kernel;
    let [oh, ow] = options.output_shape([h, w]).unwrap_or([0, 0]);
    let scale = 1. / (kh * kw) as f32;
    let mut output = Array4::zeros([n, c, oh, ow]);
    Zip::from(output.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut y, x| {
            Zip::indexed(&mut y).for_each(|(ci, oy, ox), y| {
                let mut sum = 0.;
                for ky in 0..kh {
                    for kx in 0..kw {
                        if let Some([iy, ix]) = options.input_index([oy, ox], [ky, kx], [h, w]) {
                            sum += x[[ci, iy, ix]];
                        }
                    }
                }
                *y = sum * scale;
            });
        });
    output
}

/// Spreads each output gradient evenly over its window.
pub(super) fn mean_pool2_backward(
    output_grad: ArrayView4<f32>,
    [n, c, h, w]: [usize; 4],
    options: &Conv2Options,
) -> Array4<f32> {
    let [kh, kw] = options.kernel;
    let scale = 1. / (kh * kw) as f32;
    let mut input_grad = Array4::zeros([n, c, h, w]);
    Zip::from(input_grad.outer_iter_mut())
        .and(output_grad.outer_iter())
        .par_for_each(|mut dx, dy| {
            Zip::indexed(dy).for_each(|(ci, oy, ox), dy| {
                for ky in 0..kh {
                    for kx in 0..kw {
                        if let Some([iy, ix]) = options.input_index([oy, ox], [ky, kx], [h, w]) {
                            dx[[ci, iy, ix]] += dy * scale;
                        }
                    }
                }
            });
        });
    input_grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array, Axis};

    fn options(kernel: usize, stride: usize, padding: usize) -> Conv2Options {
        Conv2Options {
            kernel: [kernel; 2],
            strides: [stride; 2],
            padding: [padding; 2],
        }
    }

    fn image(h: usize, w: usize, values: Vec<f32>) -> Array4<f32> {
        Array::from_shape_vec([1, 1, h, w], values).unwrap()
    }

    #[test]
    fn output_shape() {
        assert_eq!(options(5, 1, 0).output_shape([28, 28]), Some([24, 24]));
        assert_eq!(options(2, 2, 0).output_shape([24, 24]), Some([12, 12]));
        assert_eq!(options(3, 1, 1).output_shape([7, 7]), Some([7, 7]));
        assert_eq!(options(3, 1, 0).output_shape([2, 2]), None);
    }

    #[test]
    fn im2col_col2im_counts_overlaps() {
        let options = options(2, 1, 0);
        let x = Array::from_shape_fn([1, 1, 3, 3], |(_, _, y, x)| (y * 3 + x) as f32);
        let cols = im2col(x.view(), &options);
        assert_eq!(cols.dim(), (1, 4, 4));
        let patches = cols.index_axis(Axis(0), 0);
        assert_eq!(patches.row(0), array![0., 1., 3., 4.]);
        assert_eq!(patches.row(3), array![4., 5., 7., 8.]);
        let ones = Array3::ones(cols.raw_dim());
        let dx = col2im(ones.view(), [1, 1, 3, 3], &options);
        assert_eq!(
            dx.index_axis(Axis(0), 0).index_axis(Axis(0), 0),
            array![[1., 2., 1.], [2., 4., 2.], [1., 2., 1.]]
        );
    }

    #[test]
    fn im2col_zero_padding() {
        let x = Array::ones([1, 1, 2, 2]);
        let cols = im2col(x.view(), &options(3, 1, 1));
        assert_eq!(cols.dim(), (1, 4, 9));
        assert_eq!(
            cols.index_axis(Axis(0), 0).row(0),
            array![0., 0., 0., 0., 1., 1., 0., 1., 1.]
        );
    }

    #[test]
    fn max_pool() {
        #[rustfmt::skip]
        let x = image(4, 4, vec![
            1., 2., 0., 0.,
            3., 4., 0., 5.,
            0., 0., 1., 0.,
            6., 0., 0., 0.,
        ]);
        let (y, indices) = max_pool2(x.view(), &options(2, 2, 0));
        assert_eq!(y, image(2, 2, vec![4., 5., 6., 1.]));
        let dx = max_pool2_backward(Array::ones(y.raw_dim()).view(), indices.view(), [1, 1, 4, 4]);
        assert_eq!(dx.sum(), 4.);
        assert_eq!(dx[[0, 0, 1, 1]], 1.);
        assert_eq!(dx[[0, 0, 3, 0]], 1.);
    }

    #[test]
    fn mean_pool() {
        let x = image(2, 2, vec![1., 2., 3., 6.]);
        let y = mean_pool2(x.view(), &options(2, 2, 0));
        assert_eq!(y, image(1, 1, vec![3.]));
        let dx = mean_pool2_backward(image(1, 1, vec![4.]).view(), [1, 1, 2, 2], &options(2, 2, 0));
        assert_eq!(dx, Array::<f32, _>::ones([1, 1, 2, 2]));
    }
}
