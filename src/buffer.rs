//! Bounded in-memory buffer of images awaiting a flush to cell stores.

use std::mem;

use crate::image::Image;

#[derive(Debug)]
pub struct ImageBuffer {
    capacity: usize,
    images: Vec<Image>,
    end_of_range: bool,
}

impl ImageBuffer {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ImageBuffer {
            capacity,
            images: Vec::with_capacity(capacity),
            end_of_range: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Images must arrive in non-decreasing timestamp order.
    pub fn push(&mut self, image: Image) {
        debug_assert!(
            self.images
                .last()
                .map_or(true, |last| last.timestamp <= image.timestamp),
            "image {} pushed after a later one",
            image.timestamp
        );
        self.images.push(image);
    }

    /// Signals that no more images will be pushed for this range.
    pub fn end_of_range(&mut self) {
        self.end_of_range = true;
    }

    pub fn should_flush(&self) -> bool {
        self.images.len() >= self.capacity || (self.end_of_range && !self.images.is_empty())
    }

    pub fn drain(&mut self) -> Vec<Image> {
        self.end_of_range = false;
        mem::replace(&mut self.images, Vec::with_capacity(self.capacity))
    }
}

// -- Tests -------------------------------------------------------------------
