use super::*;

#[test]
fn size_in_bytes_is_width_height_pixel_size() {
    let desc = ImageDesc::new(61, 38, PlaneFormat::RGB_F32);
    assert_eq!(desc.size_in_bytes(), 61 * 38 * 12);
    assert_eq!(desc.pixel_count(), 61 * 38);
    assert_eq!(desc.row_bytes(), 61 * 12);

    let desc = ImageDesc::new(7, 5, PlaneFormat::GRAY_U16);
    assert_eq!(desc.size_in_bytes(), 7 * 5 * 2);
}

#[test]
fn new_empty_is_zeroed() {
    let img = Image::new_empty(ImageDesc::new(8, 4, PlaneFormat::GRAY_F32)).unwrap();
    assert_eq!(img.bytes().len(), 8 * 4 * 4);
    assert!(img.bytes().iter().all(|&b| b == 0));
}

#[test]
fn new_with_data_validates_length() {
    let desc = ImageDesc::new(4, 4, PlaneFormat::GRAY_F32);
    assert!(Image::new_with_data(desc, vec![0u8; 3]).is_err());
    assert!(Image::new_with_data(desc, vec![0u8; desc.size_in_bytes()]).is_ok());
}

#[test]
#[should_panic(expected = "dimensions must be positive")]
fn zero_dimensions_are_rejected() {
    let _ = ImageDesc::new(0, 4, PlaneFormat::GRAY_F32);
}

#[test]
fn take_leaves_moved_from_state() {
    let mut img = Image::new_empty(ImageDesc::new(4, 4, PlaneFormat::GRAY_F32)).unwrap();
    let taken = img.take();

    assert_eq!(taken.desc().width, 4);
    assert_eq!(img.desc().width, 0);
    assert_eq!(img.desc().height, 0);
    assert!(img.bytes().is_empty());
}

#[test]
fn typed_pixel_views() {
    let desc = ImageDesc::new(2, 2, PlaneFormat::GRAY_F32);
    let mut img = Image::new_empty(desc).unwrap();

    img.pixels_mut::<f32>().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(img.pixels::<f32>(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn for_each_row_writes_every_row() {
    let desc = ImageDesc::new(16, 32, PlaneFormat::GRAY_U16);
    let mut img = Image::new_empty(desc).unwrap();

    img.for_each_row(|y, row| {
        for chunk in row.chunks_exact_mut(2) {
            chunk.copy_from_slice(&(y as u16).to_le_bytes());
        }
        Ok(())
    })
    .unwrap();

    let pixels = img.pixels::<u16>();
    for y in 0..32 {
        for x in 0..16 {
            assert_eq!(pixels[y * 16 + x], y as u16);
        }
    }
}

#[test]
fn for_each_row_propagates_errors() {
    let desc = ImageDesc::new(4, 8, PlaneFormat::GRAY_F32);
    let mut img = Image::new_empty(desc).unwrap();

    let result = img.for_each_row(|y, _row| {
        if y == 5 {
            Err(Error::InvalidPlaneFormat("forced".to_string()))
        } else {
            Ok(())
        }
    });

    assert!(matches!(result, Err(Error::InvalidPlaneFormat(_))));
}
