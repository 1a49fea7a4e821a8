//! Directory source through the pipeline, the prefetch loader, and collation.

use image::{GrayImage, RgbImage};
use seg_dataset::{
    collate, BoundaryConfig, Connectivity, DirectorySource, LoaderConfig, Normalizer,
    PrefetchLoader, SampleSource, SegPipelineBuilder,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

type B = burn::backend::ndarray::NdArray<f32>;

fn write_dataset(root: &std::path::Path, count: usize, size: u32) {
    let images_dir = root.join("images");
    let labels_dir = root.join("labels");
    fs::create_dir_all(&images_dir).unwrap();
    fs::create_dir_all(&labels_dir).unwrap();
    for i in 0..count {
        let img = RgbImage::from_pixel(size, size, image::Rgb([100, 150, 200]));
        img.save(images_dir.join(format!("{i:02}.png"))).unwrap();

        let mut labels = GrayImage::new(size, size);
        for (_x, y, p) in labels.enumerate_pixels_mut() {
            *p = image::Luma([if y < size / 2 { 0 } else { 1 }]);
        }
        labels.save(labels_dir.join(format!("{i:02}.png"))).unwrap();
    }
}

#[test]
fn directory_to_batch_keeps_boundary_aligned() {
    let temp = tempdir().unwrap();
    write_dataset(temp.path(), 3, 8);

    let source = DirectorySource::index(temp.path()).unwrap();
    assert_eq!(source.len(), 3);

    let pipeline = SegPipelineBuilder::new()
        .target_size(Some((8, 8)))
        .boundary(BoundaryConfig {
            width: 1,
            ignore_label: 255,
            connectivity: Connectivity::Eight,
        })
        .seed(Some(1))
        .build()
        .unwrap();

    let loader = PrefetchLoader::spawn(
        Arc::new(source),
        pipeline,
        vec![0, 1, 2],
        LoaderConfig {
            batch_size: 3,
            shuffle: false,
            seed: None,
            drop_last: false,
            prefetch: 1,
        },
    );

    let samples = loader.next_samples().unwrap().expect("one full batch");
    assert_eq!(samples.len(), 3);
    for sample in &samples {
        let boundary = sample.boundary.as_ref().unwrap();
        assert_eq!(boundary.dimensions(), sample.labels.dimensions());
        // The horizontal seam between rows 3 and 4 must be marked.
        for x in 0..8 {
            assert_eq!(boundary.get(x, 3), 1);
            assert_eq!(boundary.get(x, 4), 1);
            assert_eq!(boundary.get(x, 0), 0);
            assert_eq!(boundary.get(x, 7), 0);
        }
    }

    let device = Default::default();
    let batch = collate::<B>(&samples, &Normalizer::default(), &device).unwrap();
    assert_eq!(batch.images.dims(), [3, 3, 8, 8]);
    assert_eq!(batch.labels.dims(), [3, 8, 8]);
    assert_eq!(batch.boundary.dims(), [3, 8, 8]);
    assert_eq!(batch.sample_ids, vec![0, 1, 2]);

    assert!(loader.next_samples().unwrap().is_none());
}

#[test]
fn missing_label_file_is_reported_at_indexing() {
    let temp = tempdir().unwrap();
    write_dataset(temp.path(), 1, 4);
    // Add an image with no matching label map.
    let orphan = RgbImage::new(4, 4);
    orphan
        .save(temp.path().join("images").join("orphan.png"))
        .unwrap();
    assert!(DirectorySource::index(temp.path()).is_err());
}
