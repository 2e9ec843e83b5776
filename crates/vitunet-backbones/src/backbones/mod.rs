pub mod vgg;
