use image::DynamicImage;
use rand::Rng;

use crate::data::dataset::BoundingBox;

pub struct DataAugmentation {
    pub enable: bool,
    pub flip_prob: f64,
    pub brightness_prob: f64,
}

impl DataAugmentation {
    pub fn new(enable: bool) -> Self {
        Self {
            enable,
            flip_prob: 0.5,
            brightness_prob: 0.3,
        }
    }

    pub fn apply(&self, img: DynamicImage, boxes: Vec<BoundingBox>) -> (DynamicImage, Vec<BoundingBox>) {
        self.apply_with(img, boxes, &mut rand::thread_rng())
    }

    pub fn apply_with<R: Rng>(
        &self,
        img: DynamicImage,
        boxes: Vec<BoundingBox>,
        rng: &mut R,
    ) -> (DynamicImage, Vec<BoundingBox>) {
        if !self.enable {
            return (img, boxes);
        }

        let (mut img, mut boxes) = (img, boxes);

        // Random horizontal flip, boxes mirrored with the image
        if rng.gen_bool(self.flip_prob) {
            img = img.fliph();
            boxes = boxes.iter().map(BoundingBox::flip_horizontal).collect();
        }

        // Random brightness adjustment
        if rng.gen_bool(self.brightness_prob) {
            let shift = rng.gen_range(-20..=20);
            img = img.brighten(shift);
        }

        (img, boxes)
    }
}
