use candle_core::Tensor;

use teppan::Backend;

impl Backend for Tensor {
    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }

    fn cat(tensors: &[Self]) -> Self {
        Tensor::cat(tensors, 0).expect("concatenates along the batch dimension")
    }

    fn slice(&self, start: usize, end: usize) -> Self {
        self.narrow(0, start, end - start)
            .expect("slices along the batch dimension")
    }
}
