use crate::{
    error::DatasetError,
    transforms::{letterbox_ratio, Preproc},
};
use anyhow::anyhow;
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor},
};
use image::{imageops::FilterType, ImageReader, RgbImage};
use rayon::prelude::*;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const VOC_CLASSES: [&str; 1] = ["face"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

/// Where decoded, resized images are kept when caching is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Ram,
    Disk,
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheType::Ram => "ram",
            CacheType::Disk => "disk",
        })
    }
}

impl FromStr for CacheType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ram" => Ok(CacheType::Ram),
            "disk" => Ok(CacheType::Disk),
            other => Err(anyhow!("Unknown cache type: {other} (expected ram or disk)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBox {
    /// x0, y0, x1, y1, 0-based pixels of the original image.
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub difficult: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub width: u32,
    pub height: u32,
    pub objects: Vec<ObjectBox>,
}

impl Annotation {
    pub fn parse(xml: &str, path: &Path) -> Result<Self, DatasetError> {
        let doc = roxmltree::Document::parse(xml).map_err(|e| xml_error(path, e.to_string()))?;
        let root = doc.root_element();

        let (width, height) = match child(root, "size") {
            Some(size) => (
                number(size, "width", path)? as u32,
                number(size, "height", path)? as u32,
            ),
            None => (0, 0),
        };

        let mut objects = Vec::new();
        for obj in root.children().filter(|c| c.has_tag_name("object")) {
            let name = child_text(obj, "name")
                .ok_or_else(|| xml_error(path, "object without <name>"))?
                .to_lowercase();
            let class_id = VOC_CLASSES
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| DatasetError::UnknownClass {
                    path: path.to_path_buf(),
                    name: name.clone(),
                })?;
            let difficult = child_text(obj, "difficult")
                .and_then(|t| t.parse::<i32>().ok())
                .unwrap_or(0)
                == 1;
            let bndbox = child(obj, "bndbox").ok_or_else(|| xml_error(path, "object without <bndbox>"))?;

            // VOC pixel indices start at 1
            let mut bbox = [0.0; 4];
            for (v, tag) in bbox.iter_mut().zip(["xmin", "ymin", "xmax", "ymax"]) {
                *v = number(bndbox, tag, path)?.trunc() - 1.0;
            }
            objects.push(ObjectBox {
                bbox,
                class_id,
                difficult,
            });
        }

        Ok(Self {
            width,
            height,
            objects,
        })
    }

    /// `[x0, y0, x1, y1, class]` rows scaled by `r`.
    pub fn targets(&self, r: f32) -> Vec<[f32; 5]> {
        self.objects
            .iter()
            .map(|o| {
                let [x0, y0, x1, y1] = o.bbox;
                [x0 * r, y0 * r, x1 * r, y1 * r, o.class_id as f32]
            })
            .collect()
    }
}

fn xml_error(path: &Path, message: impl Into<String>) -> DatasetError {
    DatasetError::Xml {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn child<'a, 'input>(node: roxmltree::Node<'a, 'input>, name: &str) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name(name))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|c| c.text()).map(str::trim)
}

fn number(node: roxmltree::Node, name: &str, path: &Path) -> Result<f32, DatasetError> {
    let text = child_text(node, name).ok_or_else(|| xml_error(path, format!("missing <{name}>")))?;
    text.parse::<f32>()
        .map_err(|_| xml_error(path, format!("<{name}> is not a number: {text}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub id: String,
    pub index: usize,
    pub height: u32,
    pub width: u32,
    /// Factor from original image pixels to network input pixels.
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct DetectionItem {
    /// CHW, `img_size` of the producing dataset.
    pub image: Vec<f32>,
    /// `[class, cx, cy, w, h]`; empty for validation samples.
    pub targets: Vec<[f32; 5]>,
    pub info: ImageInfo,
}

/// Pascal-VOC style detection dataset: `Annotations/`, `JPEGImages/` and
/// `ImageSets/Main/<split>.txt` under `data_dir`.
#[derive(Debug)]
pub struct VocDetection {
    data_dir: PathBuf,
    split: Split,
    img_size: (usize, usize),
    preproc: Preproc,
    cache: bool,
    cache_type: CacheType,
    ids: Vec<String>,
    annotations: Vec<Annotation>,
    ram_cache: Option<Vec<RgbImage>>,
}

impl VocDetection {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        split: Split,
        img_size: (usize, usize),
        preproc: Preproc,
        cache: bool,
        cache_type: CacheType,
    ) -> Result<Self, DatasetError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        println!("📂 Chargement des données depuis: {} ({})", data_dir.display(), split.as_str());
        if !data_dir.is_dir() {
            return Err(DatasetError::MissingDir(data_dir));
        }

        let split_file = data_dir
            .join("ImageSets")
            .join("Main")
            .join(format!("{}.txt", split.as_str()));
        if !split_file.is_file() {
            return Err(DatasetError::MissingSplit(split_file));
        }
        let ids: Vec<String> = fs::read_to_string(&split_file)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let annotations = ids
            .par_iter()
            .map(|id| -> Result<Annotation, DatasetError> {
                let path = data_dir.join("Annotations").join(format!("{id}.xml"));
                let xml = fs::read_to_string(&path)?;
                let mut ann = Annotation::parse(&xml, &path)?;
                // the decoded size wins over <size>, which may be stale or zero
                let img_path = data_dir.join("JPEGImages").join(format!("{id}.jpg"));
                match image::image_dimensions(&img_path) {
                    Ok(dims) => (ann.width, ann.height) = dims,
                    Err(source) if ann.width == 0 || ann.height == 0 => {
                        return Err(DatasetError::ImageDecode { path: img_path, source })
                    }
                    Err(_) => {}
                }
                Ok(ann)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut dataset = Self {
            data_dir,
            split,
            img_size,
            preproc,
            cache,
            cache_type,
            ids,
            annotations,
            ram_cache: None,
        };
        dataset.print_statistics();

        if cache {
            dataset.cache_images()?;
        }
        Ok(dataset)
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn img_size(&self) -> (usize, usize) {
        self.img_size
    }

    pub fn preproc(&self) -> Preproc {
        self.preproc
    }

    pub fn cache(&self) -> bool {
        self.cache
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn annotation(&self, index: usize) -> Option<&Annotation> {
        self.annotations.get(index)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir
            .join(format!("img_resized_cache_{}", self.split.as_str()))
    }

    fn image_path(&self, index: usize) -> PathBuf {
        self.data_dir
            .join("JPEGImages")
            .join(format!("{}.jpg", self.ids[index]))
    }

    fn cached_image_path(&self, index: usize) -> PathBuf {
        self.cache_dir().join(format!("{}.png", self.ids[index]))
    }

    /// Ratio that fits the original image into `img_size`.
    fn resize_ratio(&self, index: usize) -> f32 {
        let ann = &self.annotations[index];
        let (in_h, in_w) = self.img_size;
        (in_h as f32 / ann.height.max(1) as f32).min(in_w as f32 / ann.width.max(1) as f32)
    }

    fn load_image(&self, index: usize) -> Result<RgbImage, DatasetError> {
        let path = self.image_path(index);
        if !path.is_file() {
            return Err(DatasetError::MissingImage(path));
        }
        let img = ImageReader::open(&path)?
            .decode()
            .map_err(|source| DatasetError::ImageDecode { path, source })?;
        Ok(img.to_rgb8())
    }

    /// Original image resized so it fits `img_size` (aspect kept).
    pub fn load_resized_img(&self, index: usize) -> Result<RgbImage, DatasetError> {
        let img = self.load_image(index)?;
        let (w, h) = img.dimensions();
        let r = self.resize_ratio(index);
        let new_w = ((w as f32 * r) as u32).max(1);
        let new_h = ((h as f32 * r) as u32).max(1);
        Ok(image::imageops::resize(&img, new_w, new_h, FilterType::Triangle))
    }

    fn cache_images(&mut self) -> Result<(), DatasetError> {
        match self.cache_type {
            CacheType::Ram => {
                let bytes: usize = self.img_size.0 * self.img_size.1 * 3 * self.len();
                println!(
                    "💾 Mise en cache RAM de {} images (~{:.2} GB max)",
                    self.len(),
                    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
                );
                let images = (0..self.len())
                    .into_par_iter()
                    .map(|i| self.load_resized_img(i))
                    .collect::<Result<Vec<_>, _>>()?;
                self.ram_cache = Some(images);
            }
            CacheType::Disk => {
                let dir = self.cache_dir();
                fs::create_dir_all(&dir)?;
                println!("💾 Cache disque: {}", dir.display());
                (0..self.len()).into_par_iter().try_for_each(|i| {
                    let path = self.cached_image_path(i);
                    if path.is_file() {
                        return Ok(());
                    }
                    self.load_resized_img(i)?
                        .save(&path)
                        .map_err(|e| DatasetError::Io(std::io::Error::other(e)))
                })?;
            }
        }
        println!("✅ Images en cache ({})", self.cache_type);
        Ok(())
    }

    /// Resized image, `[x0, y0, x1, y1, class]` targets in resized pixels and
    /// the image info, before any per-sample transform.
    pub fn pull_item(&self, index: usize) -> Result<(RgbImage, Vec<[f32; 5]>, ImageInfo), DatasetError> {
        let image = match (&self.ram_cache, self.cache_type) {
            (Some(images), _) => images[index].clone(),
            (None, CacheType::Disk) if self.cache => {
                let path = self.cached_image_path(index);
                ImageReader::open(&path)?
                    .decode()
                    .map_err(|source| DatasetError::ImageDecode { path, source })?
                    .to_rgb8()
            }
            _ => self.load_resized_img(index)?,
        };

        let ann = &self.annotations[index];
        let scale = self.resize_ratio(index);
        let info = ImageInfo {
            id: self.ids[index].clone(),
            index,
            height: ann.height,
            width: ann.width,
            scale,
        };
        Ok((image, ann.targets(scale), info))
    }

    pub fn get_item(&self, index: usize) -> Result<DetectionItem, DatasetError> {
        let (image, targets, mut info) = self.pull_item(index)?;
        // the resized image is letterboxed again; fold that ratio in too
        info.scale *= letterbox_ratio(image.dimensions(), self.img_size);
        let item = match self.preproc {
            Preproc::Train(transform) => {
                let (image, targets) = transform.apply(&image, &targets, self.img_size, &mut rand::rng());
                DetectionItem { image, targets, info }
            }
            Preproc::Val(transform) => {
                let (image, _) = transform.apply(&image, self.img_size);
                DetectionItem {
                    image,
                    targets: Vec::new(),
                    info,
                }
            }
        };
        Ok(item)
    }

    /// Zero image with no targets, handed out when a sample cannot be read.
    pub fn empty_item(&self, index: usize) -> DetectionItem {
        let (h, w) = self.img_size;
        DetectionItem {
            image: vec![0.0; 3 * h * w],
            targets: Vec::new(),
            info: ImageInfo {
                id: self.ids.get(index).cloned().unwrap_or_default(),
                index,
                height: h as u32,
                width: w as u32,
                scale: 1.0,
            },
        }
    }

    fn print_statistics(&self) {
        let total = self.len();
        let objects: usize = self.annotations.iter().map(|a| a.objects.len()).sum();
        let difficult: usize = self
            .annotations
            .iter()
            .flat_map(|a| &a.objects)
            .filter(|o| o.difficult)
            .count();
        let empty = self.annotations.iter().filter(|a| a.objects.is_empty()).count();

        println!("📊 Statistiques du dataset ({}):", self.split.as_str());
        println!("   • Total: {} images", total);
        println!("   • Objets: {} ({:.2} par image)", objects, objects as f64 / total.max(1) as f64);
        println!("   • Difficiles: {}", difficult);
        println!("   • Images sans objet: {}", empty);
        for (class_id, name) in VOC_CLASSES.iter().enumerate() {
            let count = self
                .annotations
                .iter()
                .flat_map(|a| &a.objects)
                .filter(|o| o.class_id == class_id)
                .count();
            println!("     - {}: {}", name, count);
        }
    }
}

impl Dataset<DetectionItem> for VocDetection {
    fn get(&self, index: usize) -> Option<DetectionItem> {
        if index >= self.len() {
            return None;
        }
        match self.get_item(index) {
            Ok(item) => Some(item),
            Err(e) => {
                eprintln!("⚠️  Erreur chargement {}: {}", self.ids[index], e);
                Some(self.empty_item(index))
            }
        }
    }

    fn len(&self) -> usize {
        self.len()
    }
}

#[derive(Debug, Clone)]
pub struct DetectionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Vec<Vec<[f32; 5]>>,
    pub infos: Vec<ImageInfo>,
}

#[derive(Debug, Clone)]
pub struct DetectionBatcher {
    pub image_height: usize,
    pub image_width: usize,
}

impl DetectionBatcher {
    pub fn new(img_size: (usize, usize)) -> Self {
        Self {
            image_height: img_size.0,
            image_width: img_size.1,
        }
    }
}

impl<B: Backend> Batcher<B, DetectionItem, DetectionBatch<B>> for DetectionBatcher {
    fn batch(&self, items: Vec<DetectionItem>, device: &B::Device) -> DetectionBatch<B> {
        let batch_size = items.len();
        let frame = 3 * self.image_height * self.image_width;

        let mut images_data = Vec::with_capacity(batch_size * frame);
        let mut targets = Vec::with_capacity(batch_size);
        let mut infos = Vec::with_capacity(batch_size);
        for item in items {
            if item.image.len() == frame {
                images_data.extend_from_slice(&item.image);
            } else {
                eprintln!("⚠️  Taille d'image inattendue pour {}", item.info.id);
                images_data.extend(vec![0.0; frame]);
            }
            targets.push(item.targets);
            infos.push(item.info);
        }

        let images = Tensor::<B, 1>::from_floats(&*images_data, device).reshape([
            batch_size as i32,
            3,
            self.image_height as i32,
            self.image_width as i32,
        ]);

        DetectionBatch {
            images,
            targets,
            infos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::TrainTransform;

    const XML: &str = r#"
<annotation>
  <filename>0001.jpg</filename>
  <size><width>200</width><height>100</height><depth>3</depth></size>
  <object>
    <name>Face</name>
    <difficult>0</difficult>
    <bndbox><xmin>11</xmin><ymin>21</ymin><xmax>51.7</xmax><ymax>61</ymax></bndbox>
  </object>
  <object>
    <name>face</name>
    <difficult>1</difficult>
    <bndbox><xmin>1</xmin><ymin>1</ymin><xmax>5</xmax><ymax>5</ymax></bndbox>
  </object>
</annotation>"#;

    #[test]
    fn parses_voc_annotation_to_zero_based_boxes() {
        let ann = Annotation::parse(XML, Path::new("0001.xml")).unwrap();
        assert_eq!((ann.width, ann.height), (200, 100));
        assert_eq!(ann.objects.len(), 2);
        assert_eq!(ann.objects[0].bbox, [10.0, 20.0, 50.0, 60.0]);
        assert!(!ann.objects[0].difficult);
        assert!(ann.objects[1].difficult);
        assert_eq!(ann.targets(0.5)[0], [5.0, 10.0, 25.0, 30.0, 0.0]);
    }

    #[test]
    fn unknown_class_is_reported() {
        let xml = XML.replace("<name>face</name>", "<name>dog</name>");
        match Annotation::parse(&xml, Path::new("x.xml")) {
            Err(DatasetError::UnknownClass { name, .. }) => assert_eq!(name, "dog"),
            other => panic!("expected unknown class, got {other:?}"),
        }
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(matches!(
            Annotation::parse("<annotation>", Path::new("x.xml")),
            Err(DatasetError::Xml { .. })
        ));
    }

    #[test]
    fn cache_type_parsing() {
        assert_eq!("disk".parse::<CacheType>().unwrap(), CacheType::Disk);
        assert_eq!("RAM".parse::<CacheType>().unwrap(), CacheType::Ram);
        assert!("gpu".parse::<CacheType>().is_err());
        assert_eq!(CacheType::default(), CacheType::Ram);
    }

    #[test]
    fn missing_directory_is_reported() {
        let err = VocDetection::new(
            "/definitely/not/here",
            Split::Train,
            (64, 64),
            Preproc::Train(TrainTransform::default()),
            false,
            CacheType::Ram,
        )
        .unwrap_err();
        assert!(matches!(err, DatasetError::MissingDir(_)));
    }

    #[test]
    fn decoded_size_overrides_stale_xml_and_scale_covers_both_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["Annotations", "JPEGImages", "ImageSets/Main"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        // <size> says 200x100, the image is 90x30
        fs::write(root.join("Annotations/0001.xml"), XML).unwrap();
        RgbImage::new(90, 30).save(root.join("JPEGImages/0001.jpg")).unwrap();
        fs::write(root.join("ImageSets/Main/val.txt"), "0001\n").unwrap();

        let dataset = VocDetection::new(
            root,
            Split::Val,
            (64, 64),
            Preproc::Val(crate::transforms::ValTransform::new(false)),
            false,
            CacheType::Ram,
        )
        .unwrap();
        let ann = dataset.annotation(0).unwrap();
        assert_eq!((ann.width, ann.height), (90, 30));

        let item = dataset.get_item(0).unwrap();
        assert_eq!(item.image.len(), 3 * 64 * 64);
        assert!((item.info.scale * 90.0 - 64.0).abs() < 1e-3, "scale {}", item.info.scale);
    }
}
