use cgmath::{BaseFloat, BaseNum, EuclideanSpace, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::ray::{ConvexIntersection, Intersection, Quad, Ray};
use crate::OrdFloat;

/// Represents a half-open cuboid of points: the origin is inclusive and the limit is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[repr(C)]
pub struct Bounds<T> {
    origin: Point3<T>,
    size: Vector3<T>,
}

impl<T> Bounds<T> {
    pub fn origin(self) -> Point3<T> {
        self.origin
    }

    pub fn size(self) -> Vector3<T> {
        self.size
    }
}

impl<T: BaseNum> Bounds<T> {
    #[inline]
    pub fn new(origin: Point3<T>, size: Vector3<T>) -> Self {
        assert!(size.x >= T::zero());
        assert!(size.y >= T::zero());
        assert!(size.z >= T::zero());
        Bounds { origin, size }
    }

    #[inline]
    pub fn from_size(size: Vector3<T>) -> Self {
        Bounds::new(Point3::<T>::origin(), size)
    }

    #[inline]
    pub fn from_limit(origin: Point3<T>, limit: Point3<T>) -> Self {
        assert!(origin.x <= limit.x);
        assert!(origin.y <= limit.y);
        assert!(origin.z <= limit.z);
        Bounds::new(origin, limit - origin)
    }

    #[inline]
    pub fn limit(self) -> Point3<T> {
        self.origin + self.size
    }

    #[inline]
    pub fn center(self) -> Point3<T> {
        self.origin + self.size / (T::one() + T::one())
    }

    #[inline]
    pub fn contains_point(self, point: Point3<T>) -> bool {
        let limit = self.limit();
        point.x >= self.origin.x
            && point.x < limit.x
            && point.y >= self.origin.y
            && point.y < limit.y
            && point.z >= self.origin.z
            && point.z < limit.z
    }

    /// Returns quads describing each face of the bounds, in the order front (-z), back (+z),
    /// left (-x), right (+x), bottom (-y), top (+y).
    #[inline]
    pub fn face_quads(&self) -> [Quad<T>; 6]
    where
        Vector3<T>: std::ops::Neg<Output = Vector3<T>>,
    {
        let Point3 {
            x: left,
            y: bottom,
            z: front,
        } = self.origin;
        let Point3 {
            x: right,
            y: top,
            z: back,
        } = self.limit();

        let sx = Vector3::new(self.size.x, T::zero(), T::zero());
        let sy = Vector3::new(T::zero(), self.size.y, T::zero());
        let sz = Vector3::new(T::zero(), T::zero(), self.size.z);

        let p = Point3::new;

        [
            // front
            Quad {
                origin: p(left, bottom, front),
                horizontal: sx,
                vertical: sy,
            }
            .flipped(),
            // back
            Quad {
                origin: p(right, bottom, back),
                horizontal: -sx,
                vertical: sy,
            }
            .flipped(),
            // left
            Quad {
                origin: p(left, bottom, back),
                horizontal: -sz,
                vertical: sy,
            }
            .flipped(),
            // right
            Quad {
                origin: p(right, bottom, front),
                horizontal: sz,
                vertical: sy,
            }
            .flipped(),
            // bottom
            Quad {
                origin: p(left, bottom, back),
                horizontal: sx,
                vertical: -sz,
            }
            .flipped(),
            // top
            Quad {
                origin: p(left, top, front),
                horizontal: sx,
                vertical: sz,
            }
            .flipped(),
        ]
    }

    #[inline]
    /// Checks if a ray intersects the bounds and if so returns the entry and exit points. These
    /// may be the same if the ray just touches the bounds on an edge or corner.
    pub fn cast_ray(&self, ray: &Ray<T>) -> Option<ConvexIntersection<T>>
    where
        T: BaseFloat,
    {
        // test each face plane, keep hits in front of the ray origin, then sort by t-value to find
        // the entry and exit points

        let faces = self.face_quads();
        let mut results: [Option<Intersection<T>>; 6] = [None; 6];

        for (result, face) in results.iter_mut().zip(faces.iter()) {
            *result = match ray.test_quad(face) {
                Some(int) if int.t >= T::zero() => Some(int),
                _ => None,
            };
        }

        results.sort_by_key(|x| x.map(|p| OrdFloat(p.t)));

        let mut results_iter = results.iter().flatten().cloned();

        let first = results_iter.next();
        let second = results_iter.next();

        match (first, second) {
            (Some(exit), None) if self.contains_point(ray.origin) => {
                Some(ConvexIntersection::ExitOnly { exit })
            }
            (Some(clip), None) => Some(ConvexIntersection::Clip { clip }),
            (Some(entry), Some(exit)) => Some(ConvexIntersection::PassThrough { entry, exit }),
            _ => None,
        }
    }

    #[inline]
    pub fn iter_points(self) -> impl Iterator<Item = Point3<T>>
    where
        std::ops::Range<T>: Iterator<Item = T>,
        T: Copy + 'static,
    {
        let origin = self.origin();
        let limit = self.limit();

        (origin.z..limit.z).flat_map(move |z| {
            (origin.y..limit.y)
                .flat_map(move |y| (origin.x..limit.x).map(move |x| Point3 { x, y, z }))
        })
    }

    #[inline]
    pub fn corners(self) -> [Point3<T>; 8] {
        let a = self.origin();
        let b = self.limit();

        [
            Point3::new(a.x, a.y, a.z),
            Point3::new(a.x, a.y, b.z),
            Point3::new(a.x, b.y, a.z),
            Point3::new(a.x, b.y, b.z),
            Point3::new(b.x, a.y, a.z),
            Point3::new(b.x, a.y, b.z),
            Point3::new(b.x, b.y, a.z),
            Point3::new(b.x, b.y, b.z),
        ]
    }
}
