pub mod loss;
mod network;
mod softmax;

pub use network::{Forward, Network};
pub use softmax::SoftmaxClassifier;
